//! Virtual archive layer.
//!
//! Presents directories, archives, documents and playlists as one uniform
//! tree of entries:
//!
//! - **Backends** ([`backend::ArchiveBackend`]) know how to list and decode
//!   one container format
//! - **Archivers** ([`Archiver`]) wrap a backend with caching, exclusion,
//!   directory synthesis and pre-extraction
//! - **Entries** ([`Entry`]) are what archivers list; an [`EntryNode`] pairs
//!   one with the archiver that keeps it readable
//!
//! Resolving paths that cross archive boundaries, and sharing archivers
//! between callers, is done one level up in `quire-vfs`.

mod archiver;
pub mod backend;
mod context;
mod entry;
pub mod error;
mod formats;
mod memory;
mod node;
pub mod path;
mod pre_extract;
mod stream;
mod temp;
#[cfg(test)]
mod testing;

pub use crate::archiver::{Activation, Archiver, ArchiverHandle, ArchiverId, ArchiverMeta};
pub use crate::context::ArchiveContext;
pub use crate::entry::{Entry, EntryData, EntryHandle, EntryRecord, Instance};
pub use crate::formats::FormatTable;
pub use crate::memory::{MemoryBudget, MemorySlot, ReclaimHook};
pub use crate::node::{EntryNode, EntryResolver};
pub use crate::pre_extract::{PreExtractEvent, PreExtractState, PreExtractor};
pub use crate::stream::EntryStream;
pub use crate::temp::{TempFile, TempRoot};
pub use quire_format::ArchiveFormat;
