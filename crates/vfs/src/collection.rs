//! Collecting the entries below a virtual path.
//!
//! A collection is built once by [`Registry::collect`] and then filtered for
//! whatever the caller is assembling: pages of a book, the books in a
//! folder, the archives inside an archive.

use crate::error::{ErrorKind, Result, ensure_active};
use crate::registry::Registry;
use futures::FutureExt;
use futures::future::BoxFuture;
use quire_archive::path;
use quire_archive::{ArchiverHandle, EntryHandle, EntryNode};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How far below the starting point to look.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CollectMode {
    /// Direct children only.
    #[default]
    CurrentDirectoryOnly,
    /// Everything in the same container, at any depth.
    IncludeSubdirectories,
    /// Everything, recursing into every nested container along the way.
    IncludeSubArchives,
}

impl CollectMode {
    pub fn is_recursive(self) -> bool {
        self != Self::CurrentDirectoryOnly
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectOptions {
    /// Used when the starting point is a real directory.
    pub mode: CollectMode,
    /// Used when the starting point is inside (or is) a container.
    pub mode_if_archive: CollectMode,
    /// Build fresh archivers instead of reusing live ones.
    pub ignore_cache: bool,
}

impl CollectOptions {
    /// Same mode everywhere.
    pub fn new(mode: CollectMode) -> Self {
        Self { mode, mode_if_archive: mode, ignore_cache: false }
    }

    pub fn with_mode_if_archive(mut self, mode: CollectMode) -> Self {
        self.mode_if_archive = mode;
        self
    }

    pub fn with_ignore_cache(mut self, ignore_cache: bool) -> Self {
        self.ignore_cache = ignore_cache;
        self
    }
}

/// The flat result of a traversal.
#[derive(Clone, Debug)]
pub struct EntryCollection {
    path: String,
    mode: CollectMode,
    archiver: Option<ArchiverHandle>,
    nodes: Vec<EntryNode>,
}

impl EntryCollection {
    /// The path collected from, without a trailing separator.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The mode that was actually applied.
    pub fn mode(&self) -> CollectMode {
        self.mode
    }

    /// The archiver listed at the top. Absent when the path named a single
    /// plain file.
    pub fn archiver(&self) -> Option<&ArchiverHandle> {
        self.archiver.as_ref()
    }

    pub fn nodes(&self) -> &[EntryNode] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<EntryNode> {
        self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Images only.
    pub fn images(&self) -> Vec<EntryNode> {
        filter_nodes(self.nodes.iter(), |e| e.is_image())
    }

    /// Images and anything that opens as a book. Outside of a flat listing,
    /// directories that only hold other entries are dropped.
    pub fn images_and_books(&self) -> Vec<EntryNode> {
        let keep = |e: &EntryHandle| e.is_image() || e.is_book();
        match self.mode {
            CollectMode::CurrentDirectoryOnly => filter_nodes(self.nodes.iter(), keep),
            _ => filter_nodes(page_all(&self.nodes).into_iter(), keep),
        }
    }

    /// Every leaf. Directories only survive when nothing was collected
    /// below them, as markers for empty folders.
    pub fn page_all(&self) -> Vec<EntryNode> {
        page_all(&self.nodes).into_iter().cloned().collect()
    }

    /// Containers (media included).
    pub fn sub_archives(&self) -> Vec<EntryNode> {
        filter_nodes(self.nodes.iter(), |e| e.is_archive() || e.is_media())
    }

    /// Books. Directories inside containers only count in a flat listing.
    pub fn books(&self) -> Vec<EntryNode> {
        match self.mode {
            CollectMode::CurrentDirectoryOnly => filter_nodes(self.nodes.iter(), |e| e.is_book()),
            _ => filter_nodes(self.nodes.iter(), |e| e.is_book() && !e.is_archive_directory()),
        }
    }

    /// The folder a folder list should show as the parent of this
    /// collection.
    pub fn folder_place(&self) -> Option<String> {
        let archiver = self.archiver.as_ref()?;
        let place = match self.mode {
            CollectMode::IncludeSubArchives => path::parent(archiver.root().system_path()).to_string(),
            CollectMode::IncludeSubdirectories => match archiver.parent() {
                Some(parent) => parent.system_path().to_string(),
                None => path::parent(archiver.system_path()).to_string(),
            },
            CollectMode::CurrentDirectoryOnly => path::parent(&self.path).to_string(),
        };
        Some(place)
    }
}

fn filter_nodes<'a>(nodes: impl Iterator<Item = &'a EntryNode>, keep: impl Fn(&EntryHandle) -> bool) -> Vec<EntryNode> {
    nodes.filter(|node| keep(node.entry())).cloned().collect()
}

/// Drop every node that is the directory of another node, except
/// shortcuts.
fn page_all(nodes: &[EntryNode]) -> Vec<&EntryNode> {
    let directories: HashSet<String> =
        nodes.iter().map(|node| path::parent(&node.entry().system_path()).to_string()).collect();
    nodes
        .iter()
        .filter(|node| node.entry().is_shortcut() || !directories.contains(&node.entry().system_path()))
        .collect()
}

impl Registry {
    /// Collect the entries below `path`.
    ///
    /// Real directories, containers and directories inside containers can
    /// all be collected from. A path naming anything else yields just that
    /// entry. Nested containers that fail to open are logged and skipped;
    /// cancellation always propagates.
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    pub async fn collect(
        &self,
        path: &str,
        options: CollectOptions,
        cancel: &CancellationToken,
    ) -> Result<EntryCollection> {
        let path = path::normalize(path);
        let root = self.resolve(&path, cancel).await?;
        let entry = Arc::clone(root.entry());

        let opens_as_archiver = match entry.is_file_system() {
            true => entry.is_directory() || entry.is_archive() || entry.is_media(),
            false => entry.is_archive() || entry.is_media(),
        };
        let (archiver, below) = if opens_as_archiver {
            (self.get_or_create(&root, options.ignore_cache, cancel).await?, String::new())
        } else if entry.is_directory() {
            (Arc::clone(root.archiver()), entry.name().to_string())
        } else {
            tracing::debug!("not a container; collecting the entry alone");
            return Ok(EntryCollection { path, mode: options.mode, archiver: None, nodes: vec![root] });
        };

        let mode = match archiver.is_file_system() {
            true => options.mode,
            false => options.mode_if_archive,
        };
        let entries = archiver
            .list_entries_under(&below, mode.is_recursive(), cancel)
            .await
            .map_err(ErrorKind::archive)?;
        let mut nodes: Vec<EntryNode> =
            entries.iter().map(|entry| EntryNode::new(Arc::clone(&archiver), Arc::clone(entry))).collect();

        if mode == CollectMode::IncludeSubArchives {
            let mut visited = HashSet::from([archiver.ident().to_string()]);
            nodes = self.expand(nodes, options.ignore_cache, &mut visited, cancel).await?;
        }
        tracing::debug!(count = nodes.len(), ?mode, "collected");
        Ok(EntryCollection { path, mode, archiver: Some(archiver), nodes })
    }

    /// Depth first: each container is followed by its own entries.
    fn expand<'a>(
        &'a self,
        nodes: Vec<EntryNode>,
        ignore_cache: bool,
        visited: &'a mut HashSet<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<EntryNode>>> {
        async move {
            let mut result = Vec::with_capacity(nodes.len());
            for node in nodes {
                ensure_active(cancel)?;
                let entry = Arc::clone(node.entry());
                result.push(node.clone());
                // Shortcuts can point back at us.
                if !entry.is_archive() || entry.is_shortcut() {
                    continue;
                }
                let parent = Arc::new(node);
                let children = match self.children(&parent, ignore_cache, visited, cancel).await {
                    Ok(children) => children,
                    Err(err) if err.is_canceled() => return Err(err),
                    Err(err) => {
                        tracing::warn!(entry = %entry.system_path(), error = %err, "skipping nested container");
                        continue;
                    },
                };
                result.extend(self.expand(children, ignore_cache, visited, cancel).await?);
            }
            Ok(result)
        }
        .boxed()
    }

    async fn children(
        &self,
        parent: &Arc<EntryNode>,
        ignore_cache: bool,
        visited: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<EntryNode>> {
        let archiver = self.get_or_create(parent, ignore_cache, cancel).await?;
        if !visited.insert(archiver.ident().to_string()) {
            tracing::debug!(ident = %archiver.ident(), "already collected");
            return Ok(Vec::new());
        }
        let entries = archiver.list_entries(cancel).await.map_err(ErrorKind::archive)?;
        Ok(entries
            .iter()
            .map(|entry| EntryNode::new(Arc::clone(&archiver), Arc::clone(entry)).with_parent(Arc::clone(parent)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry_in, write_zip, zip_bytes};
    use rstest::rstest;
    use std::path::Path;

    fn names(nodes: &[EntryNode]) -> Vec<String> {
        nodes.iter().map(|node| node.entry().name().to_string()).collect()
    }

    /// `books/` with a folder, a plain image and an archive that holds
    /// another archive.
    fn library(dir: &Path) -> String {
        let root = dir.join("books");
        std::fs::create_dir_all(root.join("series")).unwrap();
        std::fs::write(root.join("series/001.png"), b"s1").unwrap();
        std::fs::write(root.join("cover.png"), b"cv").unwrap();
        let inner = zip_bytes(&[("i1.png", b"i1".as_slice()), ("i2.png", b"i2".as_slice())]);
        write_zip(
            &root.join("outer.zip"),
            &[("a/b/c.txt", b"text".as_slice()), ("p1.png", b"p1".as_slice()), ("inner.zip", inner.as_slice())],
        );
        path::from_system(&root)
    }

    #[tokio::test]
    async fn test_current_directory_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());

        let collection = registry
            .collect(&format!("{root}/outer.zip"), CollectOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(collection.mode(), CollectMode::CurrentDirectoryOnly);
        assert_eq!(names(collection.nodes()), ["p1.png", "inner.zip", "a"]);
    }

    #[tokio::test]
    async fn test_subdirectories_are_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());

        let options = CollectOptions::new(CollectMode::IncludeSubdirectories);
        let collection =
            registry.collect(&format!("{root}/outer.zip"), options, &CancellationToken::new()).await.unwrap();
        let all = names(collection.nodes());
        assert_eq!(all, ["a/b/c.txt", "p1.png", "inner.zip", "a", "a/b"]);
        assert!(collection.nodes()[3].entry().is_directory());
        assert!(collection.nodes()[4].entry().is_archive_directory());
        assert_eq!(names(&collection.page_all()), ["a/b/c.txt", "p1.png", "inner.zip"]);
    }

    #[tokio::test]
    async fn test_directory_inside_archive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());

        let collection = registry
            .collect(&format!("{root}/outer.zip/a/"), CollectOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(collection.path(), format!("{root}/outer.zip/a"));
        assert_eq!(names(collection.nodes()), ["a/b"]);
    }

    #[tokio::test]
    async fn test_sub_archives_are_followed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());

        let options = CollectOptions::new(CollectMode::IncludeSubArchives);
        let collection =
            registry.collect(&format!("{root}/outer.zip"), options, &CancellationToken::new()).await.unwrap();
        let all = names(collection.nodes());
        assert_eq!(all, ["a/b/c.txt", "p1.png", "inner.zip", "i1.png", "i2.png", "a", "a/b"]);

        let nested = &collection.nodes()[3];
        assert_eq!(nested.full_path(), format!("{root}/outer.zip/inner.zip/i1.png"));
        assert_eq!(nested.parent().map(|p| p.entry().name().to_string()), Some("inner.zip".to_string()));
        assert_eq!(names(&collection.images()), ["p1.png", "i1.png", "i2.png"]);
        assert_eq!(names(&collection.sub_archives()), ["inner.zip"]);
        assert_eq!(collection.folder_place(), Some(root.clone()));
    }

    #[tokio::test]
    async fn test_real_directories_recurse_as_sub_archives() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());

        let options = CollectOptions::new(CollectMode::IncludeSubArchives)
            .with_mode_if_archive(CollectMode::CurrentDirectoryOnly);
        let collection = registry.collect(&root, options, &CancellationToken::new()).await.unwrap();
        let all = names(collection.nodes());
        assert!(all.contains(&"series".to_string()));
        assert!(all.contains(&"001.png".to_string()));
        assert!(all.contains(&"i2.png".to_string()));
        // Books: real folders and containers, not directories inside them.
        let books = names(&collection.books());
        assert!(books.contains(&"series".to_string()));
        assert!(books.contains(&"outer.zip".to_string()));
        assert!(!books.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_broken_nested_archive_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = dir.path().join("books");
        std::fs::create_dir_all(&root).unwrap();
        write_zip(&root.join("a.zip"), &[("bad.zip", b"not a zip".as_slice()), ("001.png", b"x".as_slice())]);
        let root = path::from_system(&root);

        let options = CollectOptions::new(CollectMode::IncludeSubArchives);
        let collection = registry.collect(&format!("{root}/a.zip"), options, &CancellationToken::new()).await.unwrap();
        assert_eq!(names(collection.nodes()), ["bad.zip", "001.png"]);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let options = CollectOptions::new(CollectMode::IncludeSubArchives);
        let err = registry.collect(&root, options, &cancel).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_self_referential_shortcut_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = dir.path().join("books");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("001.png"), b"x").unwrap();
        let root = path::from_system(&root);
        let playlist = format!(r#"{{ "items": [ {{ "path": "{root}" }}, {{ "path": "{root}/self.qpls" }} ] }}"#);
        std::fs::write(format!("{root}/self.qpls"), playlist).unwrap();

        let options = CollectOptions::new(CollectMode::IncludeSubArchives);
        let collection = registry.collect(&root, options, &CancellationToken::new()).await.unwrap();
        let all = names(collection.nodes());
        assert_eq!(all.iter().filter(|n| *n == "001.png").count(), 1);
        assert!(all.contains(&"self.qpls".to_string()));
    }

    #[tokio::test]
    async fn test_plain_file_collects_itself() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = library(dir.path());

        let collection = registry
            .collect(&format!("{root}/cover.png"), CollectOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(collection.archiver().is_none());
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.folder_place(), None);
    }

    #[tokio::test]
    async fn test_excluded_names_never_collected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let root = dir.path().join("books");
        std::fs::create_dir_all(&root).unwrap();
        write_zip(
            &root.join("a.zip"),
            &[("__MACOSX/._001.png", b"junk".as_slice()), ("001.png", b"x".as_slice()), ("sub/.ds_store", b"junk".as_slice())],
        );
        let root = path::from_system(&root);

        let options = CollectOptions::new(CollectMode::IncludeSubdirectories);
        let collection = registry.collect(&format!("{root}/a.zip"), options, &CancellationToken::new()).await.unwrap();
        assert_eq!(names(collection.nodes()), ["001.png"]);
    }

    #[rstest]
    #[case(CollectMode::CurrentDirectoryOnly, false)]
    #[case(CollectMode::IncludeSubdirectories, true)]
    #[case(CollectMode::IncludeSubArchives, true)]
    fn test_mode_recursion(#[case] mode: CollectMode, #[case] recursive: bool) {
        assert_eq!(mode.is_recursive(), recursive);
    }
}
