//! Virtual filesystem over containers.
//!
//! - **Registry** ([`Registry`]) builds archivers on demand, shares live ones
//!   through a weak cache, and resolves paths such as
//!   `/books/a.zip/inner.cbz/001.jpg` down to a readable node
//! - **Broker** ([`Broker`]) materializes entries of containers as temp
//!   files, one decode per entry, surviving a caller's cancellation for a
//!   short while
//! - **Collections** ([`EntryCollection`]) flatten everything below a path,
//!   optionally descending into nested containers
//!
//! ```ignore
//! use quire_archive::ArchiveContext;
//! use quire_config::Config;
//! use quire_vfs::{CollectMode, CollectOptions, Registry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let context = ArchiveContext::new(&Config::default())?;
//! let registry = Registry::new(Arc::new(context));
//! let cancel = CancellationToken::new();
//! let pages = registry
//!     .collect("/books/a.zip", CollectOptions::new(CollectMode::IncludeSubArchives), &cancel)
//!     .await?
//!     .images();
//! for page in pages {
//!     let bytes = page.open(&cancel).await?.read_all().await?;
//!     println!("{}: {} bytes", page.full_path(), bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

mod broker;
mod cache;
mod collection;
pub mod error;
mod registry;
mod temp_cache;
#[cfg(test)]
mod testing;

pub use crate::broker::{Broker, BrokerEvent};
pub use crate::cache::ArchiverCache;
pub use crate::collection::{CollectMode, CollectOptions, EntryCollection};
pub use crate::registry::Registry;
pub use crate::temp_cache::{SourceStamp, TempFileCache};
