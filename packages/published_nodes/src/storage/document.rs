//! The published nodes document and the handle naming where it lives

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::ProviderError;

/// Content of an empty published nodes file (a JSON array with no entries).
pub const EMPTY_PUBLISHED_NODES: &str = "[]";

/// SHA-256 of a document's bytes
pub type DocumentDigest = [u8; 32];

/// The full published nodes configuration as an opaque byte payload.
///
/// Parsing the entries is left to the orchestration layer.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PublishedNodesDocument {
    content: Bytes,
}

impl PublishedNodesDocument {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// An empty published nodes list
    pub fn empty() -> Self {
        Self::new(EMPTY_PUBLISHED_NODES)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.content)
    }

    pub fn into_bytes(self) -> Bytes {
        self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn digest(&self) -> DocumentDigest {
        digest_bytes(&self.content)
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest())
    }
}

pub(crate) fn digest_bytes(data: &[u8]) -> DocumentDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}

impl fmt::Debug for PublishedNodesDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Ok(text) if text.len() <= 64 => write!(f, "PublishedNodesDocument({:?})", text),
            _ => write!(f, "PublishedNodesDocument({} bytes)", self.len()),
        }
    }
}

impl From<&'static str> for PublishedNodesDocument {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PublishedNodesDocument {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Vec<u8>> for PublishedNodesDocument {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<Bytes> for PublishedNodesDocument {
    fn from(value: Bytes) -> Self {
        Self::new(value)
    }
}

/// Location of the published nodes document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigurationHandle {
    path: PathBuf,
}

impl ConfigurationHandle {
    /// Create a handle without touching the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a handle for a file-backed document, checking that the path
    /// names a file and that its containing directory exists.
    pub fn for_file(path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let handle = Self::new(path);

        if handle.path.as_os_str().is_empty() {
            return Err(ProviderError::InvalidHandle("empty path".to_string()));
        }
        if handle.path.file_name().is_none() {
            return Err(ProviderError::InvalidHandle(format!(
                "{} does not name a file",
                handle.path.display()
            )));
        }
        if handle.path.is_dir() {
            return Err(ProviderError::InvalidHandle(format!(
                "{} is a directory",
                handle.path.display()
            )));
        }

        let directory = handle.directory();
        if !directory.is_dir() {
            return Err(ProviderError::InvalidHandle(format!(
                "containing directory {} does not exist",
                directory.display()
            )));
        }

        Ok(handle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the document. A bare file name resolves to `.`
    pub fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path.file_name()
    }
}

impl fmt::Display for ConfigurationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_views() {
        let doc = PublishedNodesDocument::from("nodes: []");
        assert_eq!(doc.as_bytes(), b"nodes: []");
        assert_eq!(doc.as_str().unwrap(), "nodes: []");
        assert_eq!(doc.len(), 9);
        assert!(!doc.is_empty());

        let binary = PublishedNodesDocument::from(vec![0xff, 0xfe]);
        assert!(binary.as_str().is_err());
        assert_eq!(format!("{:?}", binary), "PublishedNodesDocument(2 bytes)");
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = PublishedNodesDocument::from("[]");
        let b = PublishedNodesDocument::from(String::from("[]"));
        let c = PublishedNodesDocument::from("[{}]");

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        // sha256("[]")
        assert_eq!(
            a.digest_hex(),
            "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945"
        );
        assert_eq!(PublishedNodesDocument::empty(), a);
    }

    #[test]
    fn test_handle_validation() {
        let dir = tempfile::tempdir().unwrap();

        let handle = ConfigurationHandle::for_file(dir.path().join("publishednodes.json")).unwrap();
        assert_eq!(handle.directory(), dir.path());
        assert_eq!(handle.file_name().unwrap(), "publishednodes.json");

        assert!(matches!(
            ConfigurationHandle::for_file(""),
            Err(ProviderError::InvalidHandle(_))
        ));
        assert!(matches!(
            ConfigurationHandle::for_file(dir.path()),
            Err(ProviderError::InvalidHandle(_))
        ));
        assert!(matches!(
            ConfigurationHandle::for_file(dir.path().join("missing").join("pn.json")),
            Err(ProviderError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_bare_file_name_resolves_to_cwd() {
        let handle = ConfigurationHandle::new("publishednodes.json");
        assert_eq!(handle.directory(), PathBuf::from("."));
        assert_eq!(handle.to_string(), "publishednodes.json");
    }
}
