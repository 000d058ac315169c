//! In-memory published nodes provider for tests and embedding
//!
//! Content swaps are whole-value under a lock, which gives the same
//! all-or-nothing visibility the file backend gets from rename.

use std::sync::Mutex as StdMutex;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;

use crate::config::{MissingFilePolicy, ProviderConfig};
use crate::storage::subscription::EventSender;
use crate::storage::{
    ChangeEvent, ChangeSubscription, ConfigurationHandle, DocumentInfo, ProviderError,
    ProviderState, PublishedNodesDocument, PublishedNodesProvider,
};

struct Stored {
    document: PublishedNodesDocument,
    modified: DateTime<Utc>,
}

struct Subscriber {
    events: EventSender,
    sequence: u64,
}

/// A provider holding the document in process memory.
///
/// `replace_externally` and `remove_externally` stand in for an operator
/// editing the file behind the provider's back; they notify subscribers,
/// while the provider's own `write` does not.
pub struct InMemoryPublishedNodesProvider {
    handle: ConfigurationHandle,
    missing_file: MissingFilePolicy,
    default_document: PublishedNodesDocument,
    create_on_write: bool,
    event_buffer: usize,
    content: RwLock<Option<Stored>>,
    write_lock: Mutex<()>,
    subscribers: StdMutex<Vec<Subscriber>>,
    closed: RwLock<bool>,
}

impl InMemoryPublishedNodesProvider {
    pub fn new(initial: Option<PublishedNodesDocument>, config: &ProviderConfig) -> Self {
        let content = initial.map(|document| Stored {
            document,
            modified: Utc::now(),
        });

        Self {
            handle: ConfigurationHandle::new("memory://publishednodes.json"),
            missing_file: config.missing_file,
            default_document: config.default_document(),
            create_on_write: config.create_on_write,
            event_buffer: config.watch.event_buffer,
            content: RwLock::new(content),
            write_lock: Mutex::new(()),
            subscribers: StdMutex::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    /// An empty provider with default policies
    pub fn empty() -> Self {
        Self::new(None, &ProviderConfig::default())
    }

    /// Replace the content as an outside actor would, notifying subscribers
    pub fn replace_externally(&self, document: PublishedNodesDocument) {
        self.store(Some(document));
        self.notify();
    }

    /// Delete the content as an outside actor would, notifying subscribers
    pub fn remove_externally(&self) {
        self.store(None);
        self.notify();
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.events.is_closed());
        subscribers.len()
    }

    fn store(&self, document: Option<PublishedNodesDocument>) {
        let mut content = self.content.write().unwrap_or_else(|e| e.into_inner());
        *content = document.map(|document| Stored {
            document,
            modified: Utc::now(),
        });
    }

    fn notify(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain_mut(|subscriber| {
            let event = ChangeEvent::new(subscriber.sequence + 1);
            match subscriber.events.try_send(Ok(event)) {
                Ok(()) => {
                    subscriber.sequence += 1;
                    true
                }
                // A pending event already covers this change
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn ensure_ready(&self) -> Result<(), ProviderError> {
        match self.state() {
            ProviderState::Ready => Ok(()),
            ProviderState::Closed => Err(ProviderError::Closed),
        }
    }

    fn replace(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        let mut content = self.content.write().unwrap_or_else(|e| e.into_inner());
        if content.is_none() && !self.create_on_write {
            return Err(ProviderError::NotFound {
                path: self.handle.path().to_path_buf(),
            });
        }
        *content = Some(Stored {
            document,
            modified: Utc::now(),
        });
        Ok(())
    }
}

impl Default for InMemoryPublishedNodesProvider {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl PublishedNodesProvider for InMemoryPublishedNodesProvider {
    fn handle(&self) -> &ConfigurationHandle {
        &self.handle
    }

    fn state(&self) -> ProviderState {
        if *self.closed.read().unwrap_or_else(|e| e.into_inner()) {
            ProviderState::Closed
        } else {
            ProviderState::Ready
        }
    }

    async fn read(&self) -> Result<PublishedNodesDocument, ProviderError> {
        self.ensure_ready()?;

        let content = self.content.read().unwrap_or_else(|e| e.into_inner());
        match (content.as_ref(), self.missing_file) {
            (Some(stored), _) => Ok(stored.document.clone()),
            (None, MissingFilePolicy::UseDefault) => Ok(self.default_document.clone()),
            (None, MissingFilePolicy::Fail) => Err(ProviderError::NotFound {
                path: self.handle.path().to_path_buf(),
            }),
        }
    }

    async fn write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        self.ensure_ready()?;
        self.replace(document)
    }

    async fn try_write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.try_lock().map_err(|_| ProviderError::Busy)?;
        self.ensure_ready()?;
        self.replace(document)
    }

    async fn exists(&self) -> Result<bool, ProviderError> {
        self.ensure_ready()?;
        Ok(self.content.read().unwrap_or_else(|e| e.into_inner()).is_some())
    }

    async fn info(&self) -> Result<DocumentInfo, ProviderError> {
        self.ensure_ready()?;

        let content = self.content.read().unwrap_or_else(|e| e.into_inner());
        Ok(match content.as_ref() {
            Some(stored) => DocumentInfo {
                exists: true,
                len: stored.document.len() as u64,
                modified: Some(stored.modified),
            },
            None => DocumentInfo::missing(),
        })
    }

    async fn watch(&self) -> Result<ChangeSubscription, ProviderError> {
        self.ensure_ready()?;

        let (tx, rx) = ChangeSubscription::channel(self.event_buffer);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                events: tx,
                sequence: 0,
            });

        Ok(ChangeSubscription::new(rx, None))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        *self.closed.write().unwrap_or_else(|e| e.into_inner()) = true;
        // Dropping the senders ends every subscription
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
