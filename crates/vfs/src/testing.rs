//! Shared fixtures for unit tests.

use crate::registry::Registry;
use quire_archive::backend::MockBackend;
use quire_archive::{ArchiveContext, Archiver, EntryNode};
use quire_config::Config;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Default configuration with the temp root inside `dir`.
pub(crate) fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.temp.root = dir.join("temp");
    config
}

pub(crate) fn context_in(dir: &Path) -> Arc<ArchiveContext> {
    Arc::new(ArchiveContext::new(&config_in(dir)).unwrap())
}

pub(crate) fn context_with(dir: &Path, tweak: impl FnOnce(&mut Config)) -> Arc<ArchiveContext> {
    let mut config = config_in(dir);
    tweak(&mut config);
    Arc::new(ArchiveContext::new(&config).unwrap())
}

pub(crate) fn registry_in(dir: &Path) -> Arc<Registry> {
    Registry::new(context_in(dir))
}

/// Node for entry `name` of a mock container that doesn't exist on disk.
pub(crate) async fn mock_node(context: &Arc<ArchiveContext>, backend: MockBackend, name: &str) -> EntryNode {
    let archiver = Archiver::with_backend(context, Box::new(backend), context.temp().path().join("book.zip"), None, None);
    let entries = archiver.list_entries(&CancellationToken::new()).await.unwrap();
    let entry = entries.iter().find(|e| e.name() == name).cloned().unwrap();
    EntryNode::new(archiver, entry)
}

/// A stored ZIP in memory. Names ending in `/` become directory records.
pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        match name.ends_with('/') {
            true => writer.add_directory(*name, options).unwrap(),
            false => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            },
        }
    }
    writer.finish().unwrap().into_inner()
}

pub(crate) fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    std::fs::write(path, zip_bytes(files)).unwrap();
}
