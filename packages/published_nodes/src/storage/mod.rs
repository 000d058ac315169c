//! Storage access for the published nodes file
//!
//! This module defines the provider seam the publisher's orchestration layer
//! uses to read, persist and watch the document describing which OPC UA nodes
//! are published. Backends live in [`backends`]; the document and its location
//! types live in [`document`].

pub mod backends;
pub mod document;
mod subscription;
mod watch;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use document::{ConfigurationHandle, PublishedNodesDocument};
pub use subscription::ChangeSubscription;

/// Error types for published nodes storage operations
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Published nodes file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Access denied to {}: {source}", .path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Another write is in progress")]
    Busy,

    #[error("Provider is closed")]
    Closed,

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Invalid configuration handle: {0}")]
    InvalidHandle(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Classify an I/O failure on `path` into the provider's taxonomy.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => Self::Access {
                path: path.to_path_buf(),
                source,
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    /// True when the document is absent. Orchestration treats this as
    /// "no nodes configured yet" under a default-empty policy.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Lifecycle of a provider instance.
///
/// Construction is the `Uninitialized -> Ready` transition: constructors either
/// hand back a ready provider or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderState {
    Ready,
    Closed,
}

/// Hint that the document may have changed. Consumers re-read to find out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique identity of this notification
    pub id: Uuid,
    /// Position within the subscription that produced it, starting at 1
    pub sequence: u64,
    /// When the change was observed
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            observed_at: Utc::now(),
        }
    }
}

/// Point-in-time metadata about the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub exists: bool,
    pub len: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl DocumentInfo {
    pub fn missing() -> Self {
        Self {
            exists: false,
            len: 0,
            modified: None,
        }
    }
}

/// Access to the published nodes document.
///
/// Implemented by the filesystem backend and by an in-memory backend for
/// tests; consumers only ever see this trait.
#[async_trait]
pub trait PublishedNodesProvider: Send + Sync {
    /// Location of the document. Fixed for the life of the provider.
    fn handle(&self) -> &ConfigurationHandle;

    /// Current lifecycle state
    fn state(&self) -> ProviderState;

    /// Read the complete current document
    async fn read(&self) -> Result<PublishedNodesDocument, ProviderError>;

    /// Atomically replace the document, waiting for any in-flight write
    async fn write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError>;

    /// Like [`write`](Self::write) but fails with [`ProviderError::Busy`]
    /// instead of queuing behind another writer
    async fn try_write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError>;

    /// Check whether the document currently exists
    async fn exists(&self) -> Result<bool, ProviderError>;

    /// Size and modification time of the document
    async fn info(&self) -> Result<DocumentInfo, ProviderError>;

    /// Register for change notifications
    async fn watch(&self) -> Result<ChangeSubscription, ProviderError>;

    /// Shut the provider down and release every watch
    async fn close(&self) -> Result<(), ProviderError>;

    /// Write `document` only if nothing exists yet. Returns whether it wrote.
    async fn seed_if_absent(&self, document: PublishedNodesDocument) -> Result<bool, ProviderError> {
        if self.exists().await? {
            return Ok(false);
        }
        self.write(document).await?;
        Ok(true)
    }
}
