//! Extraction broker: turns an entry inside a container into a temp file.
//!
//! At most one decode runs per entry ident. Callers asking for the same
//! ident while it runs join it. A caller giving up does not stop the decode:
//! once the last waiter is gone, the extraction is parked as an orphan, so a
//! request that comes straight back (rapid re-navigation) picks it up where
//! it is. A finished orphan nobody reclaims is dropped after a short grace
//! period and announced as [`BrokerEvent::Expired`].

use crate::error::{ErrorKind, Result, ensure_active};
use crate::temp_cache::{SourceStamp, TempFileCache};
use async_stream::stream;
use futures::Stream;
use quire_archive::{ArchiveContext, EntryNode, TempFile};
use quire_format::extension_of;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    /// An orphaned extraction finished and wasn't reclaimed in time.
    Expired(String),
}

// Errors are kept as text: every waiter gets its own copy.
type Outcome = std::result::Result<Arc<TempFile>, String>;

struct Extraction {
    ident: String,
    stamp: SourceStamp,
    outcome: watch::Receiver<Option<Outcome>>,
    // Both only change under the tables lock.
    waiters: AtomicUsize,
    orphaned: AtomicU64,
}

enum Wait {
    Done(Outcome),
    Canceled,
}

impl Extraction {
    fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    async fn wait(&self, cancel: &CancellationToken) -> Wait {
        let mut outcome = self.outcome.clone();
        let finished = async move {
            match outcome.wait_for(Option::is_some).await {
                Ok(value) => value.clone().unwrap_or_else(|| Err("no result".to_string())),
                Err(_) => Err("extraction task ended without a result".to_string()),
            }
        };
        tokio::select! {
            biased;
            outcome = finished => Wait::Done(outcome),
            _ = cancel.cancelled() => Wait::Canceled,
        }
    }
}

#[derive(Default)]
struct Tables {
    inflight: HashMap<String, Arc<Extraction>>,
    orphans: HashMap<String, Arc<Extraction>>,
}

pub struct Broker {
    this: Weak<Broker>,
    context: Arc<ArchiveContext>,
    temp_files: TempFileCache,
    tables: Mutex<Tables>,
    grace: Duration,
    decodes: AtomicUsize,
    events: broadcast::Sender<BrokerEvent>,
    // Stops every running decode when the broker goes away.
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(context: Arc<ArchiveContext>) -> Arc<Self> {
        let config = &context.config().broker;
        let grace = config.orphan_grace();
        let capacity = config.temp_cache_capacity;
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            context,
            temp_files: TempFileCache::new(capacity),
            tables: Mutex::new(Tables::default()),
            grace,
            decodes: AtomicUsize::new(0),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Materialize the entry of `node` as a temp file named with the entry's
    /// extension.
    ///
    /// The file stays on disk while the returned handle (or the temp file
    /// cache) holds it.
    #[tracing::instrument(level = "debug", skip_all, fields(ident = %node.entry().ident()))]
    pub async fn extract(&self, node: &EntryNode, cancel: &CancellationToken) -> Result<Arc<TempFile>> {
        ensure_active(cancel)?;
        let ident = node.entry().ident();
        let stamp = SourceStamp::of(node);
        if let Some(file) = self.temp_files.get(&ident, &stamp) {
            tracing::trace!("temp file cache hit");
            return Ok(file);
        }

        let extraction = self.claim(&ident, &stamp, node);
        match extraction.wait(cancel).await {
            Wait::Canceled => {
                self.abandon(&extraction);
                exn::bail!(ErrorKind::Canceled)
            },
            Wait::Done(outcome) => {
                self.release(&extraction);
                match outcome {
                    Ok(file) => {
                        self.temp_files.insert(ident, stamp, Arc::clone(&file));
                        Ok(file)
                    },
                    Err(reason) => exn::bail!(ErrorKind::Extraction { ident, reason }),
                }
            },
        }
    }

    /// Join the running extraction for `ident`, reclaim its orphan, or start
    /// a new one. Extractions of an older source are never joined.
    fn claim(&self, ident: &str, stamp: &SourceStamp, node: &EntryNode) -> Arc<Extraction> {
        let mut tables = self.lock();
        let running = tables.inflight.get(ident).filter(|running| running.stamp == *stamp).cloned();
        let extraction = if let Some(running) = running {
            tracing::debug!("joining running extraction");
            running
        } else if let Some(orphan) = tables.orphans.remove(ident)
            && orphan.stamp == *stamp
        {
            tracing::debug!(finished = orphan.is_finished(), "reclaimed orphaned extraction");
            tables.inflight.insert(ident.to_string(), Arc::clone(&orphan));
            orphan
        } else {
            let started = self.start(ident, stamp, node);
            tables.inflight.insert(ident.to_string(), Arc::clone(&started));
            started
        };
        extraction.waiters.fetch_add(1, Ordering::SeqCst);
        extraction
    }

    fn start(&self, ident: &str, stamp: &SourceStamp, node: &EntryNode) -> Arc<Extraction> {
        let (sender, receiver) = watch::channel(None);
        let extraction = Arc::new(Extraction {
            ident: ident.to_string(),
            stamp: stamp.clone(),
            outcome: receiver,
            waiters: AtomicUsize::new(0),
            orphaned: AtomicU64::new(0),
        });
        self.decodes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("extraction started");

        let broker = self.this.clone();
        let context = Arc::clone(&self.context);
        let node = node.clone();
        let token = self.shutdown.child_token();
        let tracked = Arc::clone(&extraction);
        tokio::spawn(async move {
            let outcome = materialize(&context, &node, &token).await;
            let outcome = match outcome {
                Ok(file) => Ok(Arc::new(file)),
                Err(err) => {
                    tracing::warn!(ident = %tracked.ident, error = %err, "extraction failed");
                    Err(err.to_string())
                },
            };
            sender.send_replace(Some(outcome));
            if let Some(broker) = broker.upgrade() {
                broker.finished(&tracked);
            }
        });
        extraction
    }

    /// A waiter got its result.
    fn release(&self, extraction: &Arc<Extraction>) {
        let mut tables = self.lock();
        if extraction.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            remove_same(&mut tables.inflight, extraction);
        }
    }

    /// A waiter gave up. The last one to leave parks the extraction.
    fn abandon(&self, extraction: &Arc<Extraction>) {
        let mut tables = self.lock();
        if extraction.waiters.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        remove_same(&mut tables.inflight, extraction);
        let generation = extraction.orphaned.fetch_add(1, Ordering::SeqCst) + 1;
        tables.orphans.insert(extraction.ident.clone(), Arc::clone(extraction));
        let finished = extraction.is_finished();
        drop(tables);

        tracing::debug!(ident = %extraction.ident, finished, "extraction orphaned");
        if finished {
            self.schedule_expiry(Arc::clone(extraction), generation);
        }
    }

    /// The decode task is done; start the grace period if nobody is waiting.
    fn finished(&self, extraction: &Arc<Extraction>) {
        let tables = self.lock();
        let orphaned = tables.orphans.get(&extraction.ident).is_some_and(|o| Arc::ptr_eq(o, extraction));
        let generation = extraction.orphaned.load(Ordering::SeqCst);
        drop(tables);
        if orphaned {
            self.schedule_expiry(Arc::clone(extraction), generation);
        }
    }

    fn schedule_expiry(&self, extraction: Arc<Extraction>, generation: u64) {
        let broker = self.this.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(broker) = broker.upgrade() {
                broker.expire(&extraction, generation);
            }
        });
    }

    fn expire(&self, extraction: &Arc<Extraction>, generation: u64) {
        let mut tables = self.lock();
        // Reclaimed (and maybe orphaned again) since the timer started.
        if extraction.orphaned.load(Ordering::SeqCst) != generation {
            return;
        }
        if !remove_same(&mut tables.orphans, extraction) {
            return;
        }
        drop(tables);
        tracing::debug!(ident = %extraction.ident, "orphaned extraction expired");
        // Nobody listening is fine.
        let _ = self.events.send(BrokerEvent::Expired(extraction.ident.clone()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Idents of expired orphans, as they happen.
    pub fn expirations(&self) -> impl Stream<Item = String> + 'static {
        let mut events = self.events.subscribe();
        stream! {
            loop {
                match events.recv().await {
                    Ok(BrokerEvent::Expired(ident)) => yield ident,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "broker event stream lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn temp_files(&self) -> &TempFileCache {
        &self.temp_files
    }

    /// Decodes started so far.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub fn inflight_count(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.lock().orphans.len()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.lock();
        f.debug_struct("Broker")
            .field("inflight", &tables.inflight.len())
            .field("orphans", &tables.orphans.len())
            .field("temp_files", &self.temp_files.len())
            .field("grace", &self.grace)
            .finish()
    }
}

fn remove_same(table: &mut HashMap<String, Arc<Extraction>>, extraction: &Arc<Extraction>) -> bool {
    match table.get(&extraction.ident) {
        Some(held) if Arc::ptr_eq(held, extraction) => {
            table.remove(&extraction.ident);
            true
        },
        _ => false,
    }
}

async fn materialize(
    context: &ArchiveContext,
    node: &EntryNode,
    cancel: &CancellationToken,
) -> quire_archive::error::Result<TempFile> {
    let suffix = extension_of(node.entry().name()).unwrap_or_default();
    let file = context.temp().create_file("entry", &suffix)?;
    node.extract_to_file(file.path(), true, cancel).await?;
    tracing::trace!(path = %file.path().display(), "entry materialized");
    Ok(file)
}
