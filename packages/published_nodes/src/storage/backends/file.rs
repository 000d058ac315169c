//! Filesystem-backed published nodes provider
//!
//! Writes go to a temporary file in the same directory which is flushed,
//! synced and then renamed over the document, so a reader opening the file
//! sees either the previous content or the new content in full.
//!
//! Operators' tools do not always write that way, so a read is only trusted
//! when the file's metadata is the same before and after it and the file has
//! been quiet for a short settle window. Otherwise it is repeated.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};

use crate::config::{MissingFilePolicy, ProviderConfig, ReadConfig, WatchConfig};
use crate::storage::watch::{DirectoryWatch, SelfWrites};
use crate::storage::{
    ChangeSubscription, ConfigurationHandle, DocumentInfo, ProviderError, ProviderState,
    PublishedNodesDocument, PublishedNodesProvider,
};

/// A provider that keeps the published nodes document in a local file
pub struct FilePublishedNodesProvider {
    handle: ConfigurationHandle,
    missing_file: MissingFilePolicy,
    default_document: PublishedNodesDocument,
    create_on_write: bool,
    read_config: ReadConfig,
    watch_config: WatchConfig,
    /// Serializes writers; `try_write` fails fast when it is held
    write_lock: Mutex<()>,
    self_writes: Arc<SelfWrites>,
    shutdown: watch::Sender<bool>,
}

impl FilePublishedNodesProvider {
    /// Create a provider for `path` using the policies in `config`.
    /// The backend selection in `config` is ignored.
    pub fn new(path: impl Into<std::path::PathBuf>, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let handle = ConfigurationHandle::for_file(path)?;
        let (shutdown, _) = watch::channel(false);

        log::debug!("Opened published nodes provider for {}", handle);

        Ok(Self {
            handle,
            missing_file: config.missing_file,
            default_document: config.default_document(),
            create_on_write: config.create_on_write,
            read_config: config.read.clone(),
            watch_config: config.watch.clone(),
            write_lock: Mutex::new(()),
            self_writes: Arc::new(SelfWrites::default()),
            shutdown,
        })
    }

    /// Create a provider with default policies
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self, ProviderError> {
        Self::new(path, &ProviderConfig::default())
    }

    fn ensure_ready(&self) -> Result<(), ProviderError> {
        match self.state() {
            ProviderState::Ready => Ok(()),
            ProviderState::Closed => Err(ProviderError::Closed),
        }
    }

    /// Read the whole file, repeating the read until it can be shown that
    /// nobody modified the file while it was being read. `None` when the
    /// file does not exist.
    async fn read_stable(&self) -> Result<Option<Vec<u8>>, ProviderError> {
        let path = self.handle.path();
        let settle = self.read_config.settle();
        let attempts = self.read_config.max_attempts.max(1);

        for attempt in 1..=attempts {
            let before = match snapshot(path).await? {
                Some(before) => before,
                None => return Ok(None),
            };
            let data = match tokio::fs::read(path).await {
                Ok(data) => data,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ProviderError::from_io(path, e)),
            };
            let after = snapshot(path).await?;

            if after.as_ref() == Some(&before) && data.len() as u64 == before.len {
                if !before.is_fresh(settle) {
                    return Ok(Some(data));
                }
                // Recently touched: an in-place writer may only be pausing
                tokio::time::sleep(settle).await;
                if snapshot(path).await?.as_ref() == Some(&before) {
                    return Ok(Some(data));
                }
            } else {
                tokio::time::sleep(settle).await;
            }

            log::debug!("{} changed while being read (attempt {})", self.handle, attempt);
        }

        log::warn!(
            "Giving up reading {} after {} attempts, it keeps changing",
            self.handle,
            attempts
        );
        Err(ProviderError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::Other,
                format!("document kept changing across {} read attempts", attempts),
            ),
        })
    }

    /// Perform the atomic replace. Callers hold `write_lock`.
    async fn replace(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        let path = self.handle.path().to_path_buf();

        if !self.create_on_write && !exists_at(&path).await? {
            return Err(ProviderError::NotFound { path });
        }

        let generation = self.self_writes.record(document.digest());
        let directory = self.handle.directory();
        let len = document.len();

        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            replace_atomically(&target, &directory, document.as_bytes())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                log::info!("Wrote {} bytes to {}", len, path.display());
                Ok(())
            }
            Ok(Err(e)) => {
                self.self_writes.forget(generation);
                log::error!("Failed to write {}: {}", path.display(), e);
                Err(ProviderError::from_io(&path, e))
            }
            Err(e) => {
                self.self_writes.forget(generation);
                Err(ProviderError::Io {
                    path,
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })
            }
        }
    }
}

/// Write `data` next to `path` and rename it into place. The temporary file
/// is removed if anything fails before the rename completes.
fn replace_atomically(path: &Path, directory: &Path, data: &[u8]) -> io::Result<()> {
    let prefix = match path.file_name() {
        Some(name) => format!(".{}.", name.to_string_lossy()),
        None => ".published-nodes.".to_string(),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(directory)?;

    temp.write_all(data)?;
    temp.flush()?;

    // Keep the mode operators gave the existing file
    if let Ok(metadata) = std::fs::metadata(path) {
        temp.as_file().set_permissions(metadata.permissions())?;
    }
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The parts of a file's metadata that change whenever its content does
#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    len: u64,
    modified: Option<SystemTime>,
    /// Device, inode and status change time
    #[cfg(unix)]
    identity: (u64, u64, i64, i64),
}

impl Snapshot {
    fn of(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            #[cfg(unix)]
            identity: (
                metadata.dev(),
                metadata.ino(),
                metadata.ctime(),
                metadata.ctime_nsec(),
            ),
        }
    }

    fn is_fresh(&self, window: Duration) -> bool {
        match self.modified {
            Some(modified) => SystemTime::now()
                .duration_since(modified)
                .map_or(true, |age| age < window),
            None => true,
        }
    }
}

async fn snapshot(path: &Path) -> Result<Option<Snapshot>, ProviderError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(Snapshot::of(&metadata))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProviderError::from_io(path, e)),
    }
}

async fn exists_at(path: &Path) -> Result<bool, ProviderError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ProviderError::from_io(path, e)),
    }
}

#[async_trait]
impl PublishedNodesProvider for FilePublishedNodesProvider {
    fn handle(&self) -> &ConfigurationHandle {
        &self.handle
    }

    fn state(&self) -> ProviderState {
        if *self.shutdown.borrow() {
            ProviderState::Closed
        } else {
            ProviderState::Ready
        }
    }

    async fn read(&self) -> Result<PublishedNodesDocument, ProviderError> {
        self.ensure_ready()?;

        match self.read_stable().await? {
            Some(data) => Ok(PublishedNodesDocument::from(data)),
            None if self.missing_file == MissingFilePolicy::UseDefault => {
                log::debug!("{} does not exist, serving default document", self.handle);
                Ok(self.default_document.clone())
            }
            None => Err(ProviderError::NotFound {
                path: self.handle.path().to_path_buf(),
            }),
        }
    }

    async fn write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        // The provider may have closed while this write was queued
        self.ensure_ready()?;
        self.replace(document).await
    }

    async fn try_write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.try_lock().map_err(|_| ProviderError::Busy)?;
        self.ensure_ready()?;
        self.replace(document).await
    }

    async fn exists(&self) -> Result<bool, ProviderError> {
        self.ensure_ready()?;
        exists_at(self.handle.path()).await
    }

    async fn info(&self) -> Result<DocumentInfo, ProviderError> {
        self.ensure_ready()?;

        match tokio::fs::metadata(self.handle.path()).await {
            Ok(metadata) => Ok(DocumentInfo {
                exists: metadata.is_file(),
                len: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DocumentInfo::missing()),
            Err(e) => Err(ProviderError::from_io(self.handle.path(), e)),
        }
    }

    async fn watch(&self) -> Result<ChangeSubscription, ProviderError> {
        self.ensure_ready()?;

        let (tx, rx) = ChangeSubscription::channel(self.watch_config.event_buffer);
        let task = DirectoryWatch::spawn(
            &self.handle,
            self.watch_config.clone(),
            Arc::clone(&self.self_writes),
            self.shutdown.subscribe(),
            tx,
        )
        .await?;

        Ok(ChangeSubscription::new(rx, Some(task)))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        if !self.shutdown.send_replace(true) {
            log::info!("Closed published nodes provider for {}", self.handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_config() -> ProviderConfig {
        let mut config = ProviderConfig::default();
        config.watch.debounce_ms = 50;
        config
    }

    fn provider_in(dir: &Path) -> FilePublishedNodesProvider {
        FilePublishedNodesProvider::new(dir.join("publishednodes.json"), &quick_config()).unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());

        assert!(!provider.exists().await.unwrap());
        provider.write(PublishedNodesDocument::from("nodes: []")).await.unwrap();
        assert!(provider.exists().await.unwrap());
        assert_eq!(provider.read().await.unwrap().as_str().unwrap(), "nodes: []");

        let info = provider.info().await.unwrap();
        assert!(info.exists);
        assert_eq!(info.len, 9);
        assert!(info.modified.is_some());
    }

    #[tokio::test]
    async fn test_read_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());

        assert!(provider.read().await.unwrap_err().is_not_found());
        assert_eq!(provider.info().await.unwrap(), DocumentInfo::missing());
    }

    #[tokio::test]
    async fn test_default_document_policy() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProviderConfig {
            missing_file: MissingFilePolicy::UseDefault,
            default_document: "nodes: []".to_string(),
            ..quick_config()
        };
        let provider =
            FilePublishedNodesProvider::new(dir.path().join("publishednodes.json"), &config).unwrap();

        assert_eq!(provider.read().await.unwrap().as_str().unwrap(), "nodes: []");
        // Serving the default does not create the file
        assert!(!provider.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_on_write_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publishednodes.json");
        let config = ProviderConfig {
            create_on_write: false,
            ..quick_config()
        };
        let provider = FilePublishedNodesProvider::new(&path, &config).unwrap();

        let err = provider.write(PublishedNodesDocument::empty()).await.unwrap_err();
        assert!(err.is_not_found());

        std::fs::write(&path, "[]").unwrap();
        provider.write(PublishedNodesDocument::from("[{}]")).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[{}]");
    }

    #[tokio::test]
    async fn test_try_write_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());

        let guard = provider.write_lock.lock().await;
        let err = provider.try_write(PublishedNodesDocument::empty()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Busy));
        drop(guard);

        provider.try_write(PublishedNodesDocument::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_queued_behind_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider_in(dir.path()));

        let guard = provider.write_lock.lock().await;
        let queued = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.write(PublishedNodesDocument::from("[1]")).await })
        };
        // Let the write reach the lock
        tokio::time::sleep(Duration::from_millis(50)).await;

        provider.close().await.unwrap();
        drop(guard);

        assert!(matches!(queued.await.unwrap(), Err(ProviderError::Closed)));
        assert!(!provider.handle().path().exists());
    }

    #[tokio::test]
    async fn test_read_waits_out_in_place_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());
        let path = provider.handle().path().to_path_buf();

        // Truncated and not yet refilled, the way a non-atomic editor leaves it
        std::fs::write(&path, "").unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            std::fs::write(&path, "[{\"EndpointUrl\":\"opc.tcp://plc:4840\"}]").unwrap();
        });

        let document = provider.read().await.unwrap();
        writer.join().unwrap();
        assert_eq!(
            document.as_str().unwrap(),
            "[{\"EndpointUrl\":\"opc.tcp://plc:4840\"}]"
        );
    }

    #[tokio::test]
    async fn test_no_temporary_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());

        for i in 0..5 {
            provider
                .write(PublishedNodesDocument::from(format!("[{}]", i)))
                .await
                .unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("publishednodes.json")]);
    }

    #[tokio::test]
    async fn test_failed_write_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());

        // A directory squatting on the target makes the rename fail
        std::fs::create_dir(dir.path().join("publishednodes.json")).unwrap();
        let err = provider.write(PublishedNodesDocument::empty()).await.unwrap_err();
        assert!(!err.is_not_found());

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(provider.self_writes.latest().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_keeps_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publishednodes.json");
        std::fs::write(&path, "[]").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let provider = FilePublishedNodesProvider::new(&path, &quick_config()).unwrap();
        provider.write(PublishedNodesDocument::from("[{}]")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_closed_provider_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());
        assert_eq!(provider.state(), ProviderState::Ready);

        provider.close().await.unwrap();
        provider.close().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Closed);

        assert!(matches!(provider.read().await, Err(ProviderError::Closed)));
        assert!(matches!(
            provider.write(PublishedNodesDocument::empty()).await,
            Err(ProviderError::Closed)
        ));
        assert!(matches!(provider.exists().await, Err(ProviderError::Closed)));
        assert!(matches!(provider.watch().await, Err(ProviderError::Closed)));
    }

    #[tokio::test]
    async fn test_close_ends_active_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());
        let mut subscription = provider.watch().await.unwrap();

        provider.close().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), subscription.next_event())
            .await
            .expect("subscription did not end");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_own_writes_are_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_in(dir.path());
        provider.write(PublishedNodesDocument::empty()).await.unwrap();

        let mut subscription = provider.watch().await.unwrap();
        provider.write(PublishedNodesDocument::from("[1]")).await.unwrap();

        let quiet = tokio::time::timeout(Duration::from_millis(500), subscription.next_event()).await;
        assert!(quiet.is_err(), "own write produced {:?}", quiet);

        std::fs::write(provider.handle().path(), "[2]").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.next_event())
            .await
            .expect("external write was not reported");
        assert!(matches!(event, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_own_write_next_to_sibling_activity_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config();
        config.watch.debounce_ms = 5;
        let provider =
            FilePublishedNodesProvider::new(dir.path().join("publishednodes.json"), &config).unwrap();
        provider.write(PublishedNodesDocument::empty()).await.unwrap();

        let mut subscription = provider.watch().await.unwrap();
        for i in 0..5 {
            // Unrelated activity opens an evaluation that can see our content
            // before the rename event for it arrives
            std::fs::write(dir.path().join("publisher.log"), format!("line {}", i)).unwrap();
            provider
                .write(PublishedNodesDocument::from(format!("[{}]", i)))
                .await
                .unwrap();
        }

        let quiet = tokio::time::timeout(Duration::from_millis(500), subscription.next_event()).await;
        assert!(quiet.is_err(), "own write produced {:?}", quiet);
    }
}
