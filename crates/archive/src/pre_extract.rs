//! Per-archiver pre-extraction state.
//!
//! The state machine lives here; the run itself (list, pick targets, hand
//! them to the backend) is driven by [`Archiver`](crate::Archiver), which
//! is the only thing that knows both the backend and the entries.
//!
//! ```text
//!            resume                 start
//! Sleeping ---------> Idle ----------------> Extracting --+--> Done
//!    ^                 ^                                  +--> Failed
//!    |  sleep          |  resume                          +--> Canceled
//!    +-- (any) --------+-- (any)
//! ```

use crate::error::Result;
use crate::temp::TempRoot;
use derive_more::Display;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PreExtractState {
    #[display("idle")]
    Idle,
    #[display("extracting")]
    Extracting,
    #[display("done")]
    Done,
    #[display("canceled")]
    Canceled,
    #[display("failed")]
    Failed,
    #[display("sleeping")]
    Sleeping,
}

impl PreExtractState {
    /// A run may be started from here.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Idle | Self::Canceled)
    }

    /// Nothing more will happen without outside help.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Failed | Self::Sleeping)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreExtractEvent {
    Started,
    Completed,
    Canceled,
    Failed(String),
}

struct Run {
    token: CancellationToken,
    generation: u64,
}

pub struct PreExtractor {
    state: watch::Sender<PreExtractState>,
    progress: Arc<watch::Sender<u64>>,
    events: broadcast::Sender<PreExtractEvent>,
    run: Mutex<Run>,
    directory: Mutex<Option<TempDir>>,
}

impl PreExtractor {
    /// Starts out asleep.
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: watch::Sender::new(PreExtractState::Sleeping),
            progress: Arc::new(watch::Sender::new(0)),
            events,
            run: Mutex::new(Run { token: CancellationToken::new(), generation: 0 }),
            directory: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PreExtractState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PreExtractState> {
        self.state.subscribe()
    }

    /// Watch the count of entries completed so far.
    pub fn subscribe_progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PreExtractEvent> {
        self.events.subscribe()
    }

    pub(crate) fn progress_sender(&self) -> Arc<watch::Sender<u64>> {
        Arc::clone(&self.progress)
    }

    /// Cancel any run and park.
    pub(crate) fn sleep(&self) {
        let run = self.lock_run();
        run.token.cancel();
        self.set_state(PreExtractState::Sleeping);
    }

    /// Cancel any run and get ready for a new one.
    pub(crate) fn resume(&self) {
        let mut run = self.lock_run();
        run.token.cancel();
        run.token = CancellationToken::new();
        run.generation += 1;
        self.set_state(PreExtractState::Idle);
    }

    /// Move to [`Extracting`](PreExtractState::Extracting) if a run may
    /// start, returning its token and generation.
    pub(crate) fn try_begin(&self) -> Option<(CancellationToken, u64)> {
        let run = self.lock_run();
        if !self.state().is_ready() || run.token.is_cancelled() {
            return None;
        }
        self.set_state(PreExtractState::Extracting);
        let _ = self.events.send(PreExtractEvent::Started);
        Some((run.token.clone(), run.generation))
    }

    /// Record how a run ended. Ignored if the run was superseded by a
    /// sleep or resume in the meantime.
    pub(crate) fn finish(&self, generation: u64, outcome: &Result<()>) {
        let run = self.lock_run();
        if run.generation != generation || run.token.is_cancelled() {
            tracing::trace!(generation, "stale pre-extract run finished");
            return;
        }
        let (state, event) = match outcome {
            Ok(()) => (PreExtractState::Done, PreExtractEvent::Completed),
            Err(err) if err.is_canceled() => (PreExtractState::Canceled, PreExtractEvent::Canceled),
            Err(err) => (PreExtractState::Failed, PreExtractEvent::Failed(err.to_string())),
        };
        self.set_state(state);
        let _ = self.events.send(event);
    }

    /// The private temp directory, created on first use and removed with
    /// the archiver.
    pub(crate) fn directory(&self, temp: &TempRoot) -> Result<PathBuf> {
        let mut guard = self.directory.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = guard.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = temp.create_dir("arc")?;
        let path = dir.path().to_path_buf();
        *guard = Some(dir);
        Ok(path)
    }

    fn set_state(&self, state: PreExtractState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::trace!(from = %current, to = %state, "pre-extract state");
            *current = state;
            true
        });
    }

    fn lock_run(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
