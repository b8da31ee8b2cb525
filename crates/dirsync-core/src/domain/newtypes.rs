//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for identifiers, local paths
//! and remote locations. Each newtype ensures data validity at construction
//! time, so the engine never has to re-check a path it was handed.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// SessionId
// ============================================================================

/// Identifier for a single `start()`/`stop()` session, used to tag logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random SessionId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid UUID: {e}")))
    }
}

// ============================================================================
// RelativePath
// ============================================================================

/// A validated path relative to the local root
///
/// RelativePath is:
/// - Non-empty
/// - Relative (no leading `/`)
/// - Normalized to `/`-separated segments with no `.`, `..` or empty segments
///
/// The same value names the file locally (joined onto the local root) and
/// remotely (joined onto the remote prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Create a new RelativePath from a `/`-separated string
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is empty, absolute,
    /// or contains a `..` segment
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = path.as_ref();

        if raw.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Path must be relative: {raw}"
            )));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(DomainError::InvalidPath(format!(
                        "Path escapes root via ..: {raw}"
                    )))
                }
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(DomainError::InvalidPath(format!("Path is empty: '{raw}'")));
        }

        Ok(Self(segments.join("/")))
    }

    /// Derive a RelativePath from an absolute local path under `root`
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInRoot` if `path` is not under `root`, and
    /// `DomainError::InvalidPath` if it is the root itself or is not valid UTF-8
    pub fn from_local(root: &Path, path: &Path) -> Result<Self, DomainError> {
        let rel = path.strip_prefix(root).map_err(|_| {
            DomainError::PathNotInRoot(format!(
                "{} is not within {}",
                path.display(),
                root.display()
            ))
        })?;

        let mut segments = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(s) => {
                    let s = s.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(format!(
                            "Path is not valid UTF-8: {}",
                            path.display()
                        ))
                    })?;
                    segments.push(s);
                }
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Unexpected component in {}",
                        path.display()
                    )))
                }
            }
        }

        Self::new(segments.join("/"))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Resolve this path under a local root directory
    #[must_use]
    pub fn to_local(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.segments() {
            path.push(segment);
        }
        path
    }

    /// The last segment of the path
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The parent path, or `None` for a top-level entry
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.rfind('/').map(|idx| Self(self.0[..idx].to_string()))
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

// ============================================================================
// Remote locations
// ============================================================================

/// The remote directory a session mirrors into, as a URI
///
/// Accepts any URI with a base (`s3://bucket/dir`, `file:///data/dir`,
/// `https://host/dir`) or a bare filesystem path, which is converted to a
/// `file://` URI. Trailing slashes, queries and fragments are dropped so
/// that keys derived from the prefix are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePrefix {
    url: Url,
}

impl RemotePrefix {
    /// Parse a remote directory URI or path
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRemoteUri` if the input is neither a
    /// hierarchical URI nor a usable filesystem path
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::InvalidRemoteUri("empty remote URI".into()));
        }

        let mut url = match Url::parse(trimmed) {
            // A single-letter scheme is a Windows drive letter, not a URI
            Ok(url) if url.scheme().len() > 1 => url,
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Self::file_url(trimmed)?,
            Err(err) => {
                return Err(DomainError::InvalidRemoteUri(format!("{trimmed}: {err}")));
            }
        };

        if url.cannot_be_a_base() {
            return Err(DomainError::InvalidRemoteUri(format!(
                "URI has no hierarchical path: {trimmed}"
            )));
        }

        url.set_query(None);
        url.set_fragment(None);
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);

        Ok(Self { url })
    }

    fn file_url(raw: &str) -> Result<Url, DomainError> {
        let path = PathBuf::from(raw);
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(|e| DomainError::InvalidRemoteUri(format!("{raw}: {e}")))?
                .join(path)
        };

        Url::from_file_path(&absolute)
            .map_err(|()| DomainError::InvalidRemoteUri(format!("not a usable path: {raw}")))
    }

    /// The parsed URI
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The URI scheme (`file`, `s3`, `gs`, ...)
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The local directory for `file://` prefixes
    #[must_use]
    pub fn to_file_path(&self) -> Option<PathBuf> {
        if self.url.scheme() != "file" {
            return None;
        }
        self.url.to_file_path().ok()
    }

    /// Deterministically map a local relative path to its remote key
    #[must_use]
    pub fn key_for(&self, path: &RelativePath) -> RemoteKey {
        let mut url = self.url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(path.segments());
        }
        RemoteKey {
            url,
            path: path.clone(),
        }
    }
}

impl Display for RemotePrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl FromStr for RemotePrefix {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A fully-qualified remote object key
///
/// Carries both the full URI (for logging and URI-addressed backends) and
/// the path relative to the prefix it was derived from (for backends that
/// resolve keys against their own root).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    url: Url,
    path: RelativePath,
}

impl RemoteKey {
    /// The full URI of the object
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The object's path relative to its prefix
    #[must_use]
    pub fn path(&self) -> &RelativePath {
        &self.path
    }
}

impl Display for RemoteKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // RelativePath
    // ------------------------------------------------------------------

    #[test]
    fn test_relative_path_normalizes_segments() {
        let path = RelativePath::new("./logs//run-1/./log.txt").unwrap();
        assert_eq!(path.as_str(), "logs/run-1/log.txt");
        assert_eq!(path.file_name(), "log.txt");
        assert_eq!(path.parent().unwrap().as_str(), "logs/run-1");
    }

    #[test]
    fn test_relative_path_rejects_absolute() {
        assert!(matches!(
            RelativePath::new("/etc/passwd"),
            Err(DomainError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_relative_path_rejects_traversal() {
        assert!(RelativePath::new("a/../../b").is_err());
        assert!(RelativePath::new("..").is_err());
    }

    #[test]
    fn test_relative_path_rejects_empty() {
        assert!(RelativePath::new("").is_err());
        assert!(RelativePath::new("./").is_err());
    }

    #[test]
    fn test_relative_path_top_level_has_no_parent() {
        let path = RelativePath::new("ckpt-1.bin").unwrap();
        assert!(path.parent().is_none());
        assert_eq!(path.file_name(), "ckpt-1.bin");
    }

    #[test]
    fn test_relative_path_from_local() {
        let root = Path::new("/data/work");
        let path = RelativePath::from_local(root, Path::new("/data/work/a/b.txt")).unwrap();
        assert_eq!(path.as_str(), "a/b.txt");
        assert_eq!(path.to_local(root), PathBuf::from("/data/work/a/b.txt"));
    }

    #[test]
    fn test_relative_path_from_local_outside_root() {
        let root = Path::new("/data/work");
        assert!(matches!(
            RelativePath::from_local(root, Path::new("/data/other/b.txt")),
            Err(DomainError::PathNotInRoot(_))
        ));
        assert!(RelativePath::from_local(root, root).is_err());
    }

    #[test]
    fn test_relative_path_serde_roundtrip_validates() {
        let json = serde_yaml::to_string(&RelativePath::new("a/b").unwrap()).unwrap();
        let back: RelativePath = serde_yaml::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "a/b");

        let bad: Result<RelativePath, _> = serde_yaml::from_str("\"../x\"");
        assert!(bad.is_err());
    }

    // ------------------------------------------------------------------
    // RemotePrefix / RemoteKey
    // ------------------------------------------------------------------

    #[test]
    fn test_remote_prefix_object_store_uri() {
        let prefix = RemotePrefix::parse("s3://bucket/tfworkdir/").unwrap();
        assert_eq!(prefix.scheme(), "s3");
        assert_eq!(prefix.to_string(), "s3://bucket/tfworkdir");
        assert!(prefix.to_file_path().is_none());
    }

    #[test]
    fn test_remote_prefix_bare_path_is_file_uri() {
        let prefix = RemotePrefix::parse("/tmp/remote").unwrap();
        assert_eq!(prefix.scheme(), "file");
        assert_eq!(prefix.to_file_path().unwrap(), PathBuf::from("/tmp/remote"));
    }

    #[test]
    fn test_remote_prefix_rejects_opaque_uri() {
        assert!(matches!(
            RemotePrefix::parse("mailto:someone@example.com"),
            Err(DomainError::InvalidRemoteUri(_))
        ));
        assert!(RemotePrefix::parse("   ").is_err());
    }

    #[test]
    fn test_key_for_joins_prefix_and_path() {
        let prefix = RemotePrefix::parse("s3://bucket/work").unwrap();
        let key = prefix.key_for(&RelativePath::new("logs/log.txt").unwrap());
        assert_eq!(key.to_string(), "s3://bucket/work/logs/log.txt");
        assert_eq!(key.path().as_str(), "logs/log.txt");
    }

    #[test]
    fn test_key_for_bucket_root() {
        let prefix = RemotePrefix::parse("gs://bucket").unwrap();
        let key = prefix.key_for(&RelativePath::new("ckpt-1.bin").unwrap());
        assert_eq!(key.to_string(), "gs://bucket/ckpt-1.bin");
    }

    #[test]
    fn test_key_for_is_deterministic() {
        let prefix = RemotePrefix::parse("file:///srv/mirror/").unwrap();
        let path = RelativePath::new("a/b.bin").unwrap();
        assert_eq!(prefix.key_for(&path), prefix.key_for(&path));
        assert_eq!(
            prefix.key_for(&path).to_string(),
            "file:///srv/mirror/a/b.bin"
        );
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
