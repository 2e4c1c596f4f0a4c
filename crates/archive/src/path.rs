//! Virtual path utilities.
//!
//! Virtual paths mix real filesystem paths with names inside containers,
//! e.g. `/books/a.zip/inner.cbz/001.jpg`. They are plain strings using `/`
//! as the separator; backslashes (as written by Windows archivers) are
//! normalized away. Nothing here touches the filesystem.

use std::path::Path;

pub const SEPARATOR: char = '/';

/// Replace backslashes, collapse repeated separators and drop any trailing
/// separator. A leading separator (absolute path) is kept.
///
/// ```
/// use quire_archive::path::normalize;
/// assert_eq!(normalize("dir\\sub//001.jpg"), "dir/sub/001.jpg");
/// assert_eq!(normalize("/books/a.zip/"), "/books/a.zip");
/// ```
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        let c = if c == '\\' { SEPARATOR } else { c };
        if c == SEPARATOR && out.ends_with(SEPARATOR) {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with(SEPARATOR) {
        out.pop();
    }
    out
}

/// Trim trailing separators (either kind).
pub fn trim_end(path: &str) -> &str {
    path.trim_end_matches([SEPARATOR, '\\'])
}

/// Returns `true` if the raw name was written as a directory.
pub fn has_trailing_separator(path: &str) -> bool {
    path.ends_with([SEPARATOR, '\\'])
}

/// Non-empty segments of a normalized path.
pub fn split(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Last segment, or the whole path if it has none.
pub fn file_name(path: &str) -> &str {
    let trimmed = trim_end(path);
    trimmed.rsplit(SEPARATOR).next().unwrap_or(trimmed)
}

/// Everything before the last segment, without the separator. Top-level
/// names have the empty string as their parent.
pub fn parent(path: &str) -> &str {
    let trimmed = trim_end(path);
    match trimmed.rfind(SEPARATOR) {
        Some(0) if trimmed.len() > 1 => &trimmed[..1],
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

/// Join two virtual paths; either side may be empty.
pub fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    let name = name.trim_start_matches(SEPARATOR);
    match name.is_empty() {
        true => base.to_string(),
        false if base.ends_with(SEPARATOR) => format!("{base}{name}"),
        false => format!("{base}{SEPARATOR}{name}"),
    }
}

/// Every prefix of `path` that ends on a segment boundary, shortest first.
/// The path itself is the last item.
///
/// ```
/// use quire_archive::path::prefixes;
/// let all: Vec<_> = prefixes("/a/b.zip/c").collect();
/// assert_eq!(all, ["/a", "/a/b.zip", "/a/b.zip/c"]);
/// ```
pub fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|(idx, c)| *c == SEPARATOR && *idx > 0)
        .map(|(idx, _)| &path[..idx])
        .chain((!path.is_empty()).then_some(path))
}

/// The part of `path` after `prefix` and its separator, if `prefix` is a
/// segment-boundary prefix of `path`.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || prefix.ends_with(SEPARATOR) {
        Some(rest)
    } else {
        rest.strip_prefix(SEPARATOR)
    }
}

/// Returns `true` if `path` lies strictly below directory `dir`.
pub fn is_under(path: &str, dir: &str) -> bool {
    (dir.is_empty() && !path.is_empty()) || strip_prefix(path, dir).is_some_and(|rest| !rest.is_empty())
}

/// Render a real path as a virtual one.
pub fn from_system(path: &Path) -> String {
    normalize(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a\\b\\c.jpg", "a/b/c.jpg")]
    #[case("a//b///c", "a/b/c")]
    #[case("dir/", "dir")]
    #[case("/", "/")]
    #[case("", "")]
    fn test_normalize(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize(raw), expected);
    }

    #[rstest]
    #[case("a/b/c.jpg", "c.jpg", "a/b")]
    #[case("c.jpg", "c.jpg", "")]
    #[case("/tmp", "tmp", "/")]
    #[case("a/b/", "b", "a")]
    fn test_file_name_and_parent(#[case] path: &str, #[case] name: &str, #[case] dir: &str) {
        assert_eq!(file_name(path), name);
        assert_eq!(parent(path), dir);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a.jpg"), "a.jpg");
        assert_eq!(join("", "/abs/a.jpg"), "/abs/a.jpg");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("/", "tmp"), "/tmp");
        assert_eq!(join("/books/a.zip", "sub/001.jpg"), "/books/a.zip/sub/001.jpg");
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(prefixes("a/b/c").collect::<Vec<_>>(), ["a", "a/b", "a/b/c"]);
        assert_eq!(prefixes("single").collect::<Vec<_>>(), ["single"]);
        assert_eq!(prefixes("").count(), 0);
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("a/b/c", "a/b"), Some("c"));
        assert_eq!(strip_prefix("a/b", "a/b"), Some(""));
        assert_eq!(strip_prefix("a/bc", "a/b"), None);
        assert_eq!(strip_prefix("a/b", ""), Some("a/b"));
        assert_eq!(strip_prefix("/tmp", "/"), Some("tmp"));
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("a/b", "a"));
        assert!(is_under("a/b/c", "a"));
        assert!(!is_under("a", "a"));
        assert!(!is_under("ab/c", "a"));
        assert!(is_under("a", ""));
    }
}
