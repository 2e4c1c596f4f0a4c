//! Normalized extension tables.
//!
//! Extensions are stored lowercase with a leading dot (`.zip`) no matter how
//! they were written in configuration (`ZIP`, `*.zip`, `.Zip`).

/// Returns the lowercase extension (with leading dot) of the last segment of
/// a virtual path. Both `/` and `\` count as separators.
///
/// ```
/// use quire_format::extension_of;
/// assert_eq!(extension_of("dir/Book.CBZ").as_deref(), Some(".cbz"));
/// assert_eq!(extension_of("a.zip/inner").as_deref(), None);
/// assert_eq!(extension_of(".hidden").as_deref(), None);
/// ```
#[must_use]
pub fn extension_of(name: &str) -> Option<String> {
    let trimmed = name.trim_end_matches(['/', '\\']);
    let last = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    match last.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(last[idx..].to_lowercase()),
    }
}

/// A case-insensitive set of file extensions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(from = "ExtensionsRepr", into = "Vec<String>")
)]
pub struct Extensions(Vec<String>);

/// Configuration may spell a table as a list or as one joined string
/// (environment variables can only do the latter).
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum ExtensionsRepr {
    List(Vec<String>),
    Joined(String),
}

#[cfg(feature = "serde")]
impl From<ExtensionsRepr> for Extensions {
    fn from(value: ExtensionsRepr) -> Self {
        match value {
            ExtensionsRepr::List(list) => Self::new(list),
            ExtensionsRepr::Joined(joined) => Self::parse(&joined),
        }
    }
}

impl Extensions {
    /// Build a table, normalizing every item and dropping duplicates/blanks.
    pub fn new<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> Self {
        let mut list: Vec<String> = Vec::new();
        for item in items {
            let Some(ext) = Self::normalize(item.as_ref()) else {
                continue;
            };
            if !list.contains(&ext) {
                list.push(ext);
            }
        }
        Self(list)
    }

    /// Parse a `;`/`,`/whitespace separated list such as `"*.zip;*.cbz"`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split([';', ',', ' ', '\t', '\n']))
    }

    fn normalize(raw: &str) -> Option<String> {
        let ext = raw.trim().trim_start_matches('*').trim_start_matches('.');
        if ext.is_empty() {
            return None;
        }
        Some(format!(".{}", ext.to_lowercase()))
    }

    /// Check a bare extension (with or without the leading dot).
    #[must_use]
    pub fn contains(&self, ext: &str) -> bool {
        Self::normalize(ext).is_some_and(|ext| self.0.contains(&ext))
    }

    /// Check the extension of the last segment of a virtual path.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        extension_of(name).is_some_and(|ext| self.0.contains(&ext))
    }

    /// Returns `false` when an extension doesn't survive normalization
    /// unchanged, e.g. it contains a separator.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.iter().all(|ext| ext.len() > 1 && !ext[1..].contains(['.', '/', '\\']))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<String>> for Extensions {
    fn from(value: Vec<String>) -> Self {
        Self::new(value)
    }
}

impl From<Extensions> for Vec<String> {
    fn from(value: Extensions) -> Self {
        value.0
    }
}

impl<'a> FromIterator<&'a str> for Extensions {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("book.zip", Some(".zip"))]
    #[case("dir\\Book.ZIP", Some(".zip"))]
    #[case("a.tar.gz", Some(".gz"))]
    #[case("dir.d/file", None)]
    #[case("folder/", None)]
    #[case("archive.7z/", Some(".7z"))]
    #[case(".gitignore", None)]
    #[case("", None)]
    fn test_extension_of(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(extension_of(name).as_deref(), expected);
    }

    #[test]
    fn test_normalization() {
        let ext = Extensions::parse("*.ZIP; cbz,.Cbz  7z");
        assert_eq!(ext.iter().collect::<Vec<_>>(), vec![".zip", ".cbz", ".7z"]);
        assert!(ext.contains("zip"));
        assert!(ext.contains(".CBZ"));
        assert!(!ext.contains("rar"));
        assert!(!ext.contains(""));
    }

    #[test]
    fn test_matches() {
        let ext = Extensions::new(["jpg", "png"]);
        assert!(ext.matches("a/b/001.JPG"));
        assert!(!ext.matches("a/b/001.jpeg"));
        assert!(!ext.matches("jpg"));
    }

    #[test]
    fn test_well_formed() {
        assert!(Extensions::new(["zip", "cbz"]).is_well_formed());
        assert!(!Extensions::new(["tar.gz"]).is_well_formed());
        assert!(!Extensions::new(["a/b"]).is_well_formed());
    }
}
