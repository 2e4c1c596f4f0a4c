//! Entries: the items an archiver lists.
//!
//! Backends produce [`EntryRecord`]s. The owning [`Archiver`](crate::Archiver)
//! turns them into shared [`Entry`] values that know which archiver they
//! came from (through an [`ArchiverMeta`], never the archiver itself, so an
//! entry can't keep its owner alive).

use crate::archiver::ArchiverMeta;
use crate::memory::MemorySlot;
use crate::node::EntryNode;
use crate::path;
use quire_format::ArchiveFormat;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;

pub type EntryHandle = Arc<Entry>;

/// Backend-private locator for an entry's payload.
#[derive(Clone, Default)]
pub enum Instance {
    #[default]
    None,
    /// Position in the container's own table (ZIP, 7z, plugin records).
    Index(usize),
    /// A real file or directory.
    Path(PathBuf),
    /// 1-based page of a rendered document.
    Page(u32),
    /// Another entry somewhere in the virtual tree (playlists).
    Link(EntryNode),
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instance::None => write!(f, "None"),
            Instance::Index(i) => f.debug_tuple("Index").field(i).finish(),
            Instance::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Instance::Page(p) => f.debug_tuple("Page").field(p).finish(),
            Instance::Link(node) => f.debug_tuple("Link").field(&node.entry().ident()).finish(),
        }
    }
}

/// What a backend reports for one item.
#[derive(Clone, Debug)]
pub struct EntryRecord {
    /// Non-negative for real items; negative means "cannot be opened".
    pub id: i64,
    /// Name exactly as the container spells it (used for re-validation).
    pub raw_name: String,
    /// Uncompressed size, or `-1` for directories.
    pub length: i64,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
    /// Real or virtual path this item stands in for.
    pub link: Option<String>,
    pub instance: Instance,
}

impl EntryRecord {
    pub fn file(id: i64, raw_name: impl Into<String>, length: u64) -> Self {
        Self {
            id,
            raw_name: raw_name.into(),
            length: i64::try_from(length).unwrap_or(i64::MAX),
            created: None,
            modified: None,
            link: None,
            instance: Instance::None,
        }
    }

    pub fn directory(id: i64, raw_name: impl Into<String>) -> Self {
        Self { length: -1, ..Self::file(id, raw_name, 0) }
    }

    pub fn with_modified(mut self, modified: Option<OffsetDateTime>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_created(mut self, created: Option<OffsetDateTime>) -> Self {
        self.created = created;
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instance = instance;
        self
    }
}

/// A pre-extracted payload.
#[derive(Clone, Debug)]
pub enum EntryData {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

struct Payload {
    data: EntryData,
    // Held only to give the bytes back to the budget on drop.
    _slot: Option<MemorySlot>,
}

/// One listed item.
pub struct Entry {
    owner: Arc<ArchiverMeta>,
    id: i64,
    raw_name: String,
    name: String,
    length: i64,
    created: Option<OffsetDateTime>,
    modified: Option<OffsetDateTime>,
    link: Option<String>,
    instance: Instance,
    payload: Mutex<Option<Payload>>,
    deleted: AtomicBool,
}

impl Entry {
    pub(crate) fn new(owner: Arc<ArchiverMeta>, record: EntryRecord) -> Self {
        let name = path::normalize(&record.raw_name);
        Self {
            owner,
            id: record.id,
            raw_name: record.raw_name,
            name,
            length: record.length,
            created: record.created,
            modified: record.modified,
            link: record.link,
            instance: record.instance,
            payload: Mutex::new(None),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn raw_name(&self) -> &str {
        &self.raw_name
    }

    /// Normalized name relative to the archiver root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last segment of [`name`](Self::name).
    pub fn last_name(&self) -> &str {
        path::file_name(&self.name)
    }

    /// Size in bytes, `-1` for directories.
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn created(&self) -> Option<OffsetDateTime> {
        self.created
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.modified
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn owner(&self) -> &ArchiverMeta {
        &self.owner
    }

    pub fn is_directory(&self) -> bool {
        self.length < 0
    }

    /// Unique across every live archiver, even for duplicate names.
    pub fn ident(&self) -> String {
        path::join(&self.owner.ident, &format!("{}.{}", self.id, self.name))
    }

    /// Full logical path: the owner's system path plus this entry's name.
    pub fn system_path(&self) -> String {
        path::join(&self.owner.system_path, &self.name)
    }

    /// The link if there is one, otherwise the system path.
    pub fn target_path(&self) -> String {
        self.link.clone().unwrap_or_else(|| self.system_path())
    }

    /// Lives on disk: listed by a folder, or a link to something that is.
    pub fn is_file_system(&self) -> bool {
        match &self.instance {
            Instance::Link(node) => node.entry().is_file_system(),
            _ => self.owner.format == ArchiveFormat::FileSystem,
        }
    }

    /// Directory inside a container (as opposed to one on disk).
    pub fn is_archive_directory(&self) -> bool {
        !self.is_file_system() && self.is_directory()
    }

    /// Can be opened as an archive? Directories on disk count, directories
    /// inside containers don't. Media never counts.
    pub fn is_archive(&self) -> bool {
        match self.is_directory() {
            true => self.is_file_system(),
            false => self.owner.formats.detect_container(&self.target_path(), false).is_some(),
        }
    }

    /// Can be opened as a book (any directory, any supported container,
    /// media included).
    pub fn is_book(&self) -> bool {
        self.is_directory() || self.owner.formats.detect_container(&self.target_path(), true).is_some()
    }

    pub fn is_media(&self) -> bool {
        !self.is_directory()
            && self.owner.formats.detect_container(&self.target_path(), true) == Some(ArchiveFormat::Media)
    }

    pub fn is_image(&self) -> bool {
        !self.is_directory()
            && (self.owner.format == ArchiveFormat::Media || self.owner.formats.is_image(&self.target_path()))
    }

    /// Points at a playlist.
    pub fn is_shortcut(&self) -> bool {
        self.owner.formats.is_playlist(&self.target_path())
    }

    /// Pre-extracted payload, if any.
    pub fn data(&self) -> Option<EntryData> {
        self.lock_payload().as_ref().map(|p| p.data.clone())
    }

    pub fn has_data(&self) -> bool {
        self.lock_payload().is_some()
    }

    pub(crate) fn set_memory(&self, bytes: Arc<[u8]>, slot: Option<MemorySlot>) {
        *self.lock_payload() = Some(Payload { data: EntryData::Memory(bytes), _slot: slot });
    }

    pub(crate) fn set_file(&self, path: PathBuf) {
        *self.lock_payload() = Some(Payload { data: EntryData::File(path), _slot: None });
    }

    /// Drop an in-memory payload, returning its memory to the budget.
    /// Payloads written to disk stay. Returns the bytes released.
    pub fn reset_data(&self) -> u64 {
        let mut guard = self.lock_payload();
        let released = match guard.as_ref() {
            Some(Payload { data: EntryData::Memory(bytes), .. }) => bytes.len() as u64,
            _ => return 0,
        };
        let payload = guard.take();
        // The slot's reclaim hook may come back for this entry.
        drop(guard);
        drop(payload);
        released
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    fn lock_payload(&self) -> std::sync::MutexGuard<'_, Option<Payload>> {
        // A panic while swapping an Option can't leave it half-written.
        self.payload.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("archiver", &self.owner.id)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("length", &self.length)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.system_path())
    }
}
