//! Shared fixtures for unit tests.

use crate::archiver::ArchiverMeta;
use crate::context::ArchiveContext;
use crate::formats::FormatTable;
use crate::path;
use quire_config::Config;
use quire_format::ArchiveFormat;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Default configuration with the temp root inside `dir`.
pub(crate) fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.temp.root = dir.join("temp");
    config
}

pub(crate) fn context_in(dir: &Path) -> ArchiveContext {
    ArchiveContext::new(&config_in(dir)).unwrap()
}

pub(crate) fn shared_context(dir: &Path) -> Arc<ArchiveContext> {
    Arc::new(context_in(dir))
}

pub(crate) fn shared_context_with(dir: &Path, tweak: impl FnOnce(&mut Config)) -> Arc<ArchiveContext> {
    let mut config = config_in(dir);
    tweak(&mut config);
    Arc::new(ArchiveContext::new(&config).unwrap())
}

/// Owner for entries built by hand; `path` doubles as ident and system path.
pub(crate) fn meta(format: ArchiveFormat, path: &str) -> Arc<ArchiverMeta> {
    Arc::new(ArchiverMeta {
        id: 0,
        format,
        path: PathBuf::from(path),
        entry_name: path::file_name(path).to_string(),
        ident: path.to_string(),
        system_path: path.to_string(),
        is_root: true,
        formats: Arc::new(FormatTable::new(&Config::default(), true, false)),
    })
}

/// Write a stored ZIP. Names ending in `/` become directory records.
pub(crate) fn write_zip(path: &Path, files: &[(&str, &str)]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        match name.ends_with('/') {
            true => writer.add_directory(*name, options).unwrap(),
            false => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data.as_bytes()).unwrap();
            },
        }
    }
    writer.finish().unwrap();
}
