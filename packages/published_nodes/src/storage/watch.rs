//! Background monitor behind a file-backed change subscription
//!
//! The OS watch is placed on the directory containing the document rather than
//! on the document itself, so deleting and recreating the file (or replacing it
//! by rename) keeps being observed. Bursts of low-level events are folded into
//! one evaluation per debounce window, and an evaluation only produces a
//! [`ChangeEvent`] when the content digest moved, the file was created/removed/
//! renamed, or the change was not written by the owning provider itself.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::document::{digest_bytes, DocumentDigest};
use super::subscription::EventSender;
use super::{ChangeEvent, ConfigurationHandle, ProviderError};
use crate::config::WatchConfig;

/// A write performed by the provider that owns a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SelfWrite {
    pub generation: u64,
    pub digest: DocumentDigest,
}

/// Own writes remembered for matching against what a monitor reads
const SELF_WRITE_HISTORY: usize = 16;

/// Digests of the provider's own recent writes, shared with its monitors so
/// they can skip notifying about them.
#[derive(Debug, Default)]
pub(crate) struct SelfWrites {
    inner: Mutex<SelfWritesInner>,
}

#[derive(Debug, Default)]
struct SelfWritesInner {
    generation: u64,
    recent: VecDeque<SelfWrite>,
}

impl SelfWrites {
    pub fn record(&self, digest: DocumentDigest) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        let generation = inner.generation;
        if inner.recent.len() == SELF_WRITE_HISTORY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(SelfWrite { generation, digest });
        generation
    }

    /// Drop the record of a write that never landed
    pub fn forget(&self, generation: u64) {
        let mut inner = self.lock();
        inner.recent.retain(|w| w.generation != generation);
    }

    pub fn latest(&self) -> Option<SelfWrite> {
        self.lock().recent.back().copied()
    }

    /// Newest own write after `generation` that produced `digest`
    pub fn matching(&self, digest: &DocumentDigest, generation: u64) -> Option<SelfWrite> {
        self.lock()
            .recent
            .iter()
            .rev()
            .take_while(|w| w.generation > generation)
            .find(|w| w.digest == *digest)
            .copied()
    }

    /// Whether `digest` is the content of one of the remembered own writes
    pub fn wrote(&self, digest: &DocumentDigest) -> bool {
        self.lock().recent.iter().any(|w| w.digest == *digest)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SelfWritesInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Signal {
    Event(Event),
    Failed(String),
}

#[derive(Default)]
struct Batch {
    /// The document was created or removed
    recreated: bool,
    /// Something was renamed onto or away from the document
    renamed: bool,
    /// The watched directory itself was removed or moved
    directory_lost: bool,
    failed: bool,
}

impl Batch {
    fn absorb(&mut self, signal: Signal, directory: &Path, target: &OsStr) {
        match signal {
            Signal::Event(event) => {
                for path in &event.paths {
                    if path.file_name() == Some(target) {
                        match event.kind {
                            EventKind::Create(_) | EventKind::Remove(_) => self.recreated = true,
                            EventKind::Modify(ModifyKind::Name(_)) => self.renamed = true,
                            _ => {}
                        }
                    } else if path == directory
                        && matches!(
                            event.kind,
                            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
                        )
                    {
                        self.directory_lost = true;
                    }
                }
            }
            Signal::Failed(reason) => {
                log::warn!("Filesystem watcher reported an error: {}", reason);
                self.failed = true;
            }
        }
    }
}

enum Restore {
    Restored(RecommendedWatcher),
    Shutdown,
}

/// Monitor for one subscription. Owns the OS watcher for its whole life.
pub(crate) struct DirectoryWatch {
    path: PathBuf,
    directory: PathBuf,
    target: OsString,
    /// Directory the OS watch is attached to
    directory_id: Option<DirectoryId>,
    config: WatchConfig,
    self_writes: Arc<SelfWrites>,
    shutdown: watch::Receiver<bool>,
    events: EventSender,
    sequence: u64,
    last_seen: Option<DocumentDigest>,
    consumed_generation: u64,
}

impl DirectoryWatch {
    /// Establish the OS watch and start monitoring. Errors setting up the
    /// initial watch are returned to the caller instead of being retried.
    pub async fn spawn(
        handle: &ConfigurationHandle,
        config: WatchConfig,
        self_writes: Arc<SelfWrites>,
        shutdown: watch::Receiver<bool>,
        events: EventSender,
    ) -> Result<JoinHandle<()>, ProviderError> {
        let target = handle
            .file_name()
            .ok_or_else(|| ProviderError::InvalidHandle(handle.to_string()))?
            .to_os_string();
        let directory = handle.directory();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let directory_id = directory_identity(&directory).await;
        let watcher = establish(&directory, raw_tx.clone())?;

        let last_seen = current_digest(handle.path())
            .await
            .map_err(|e| ProviderError::from_io(handle.path(), e))?;
        let consumed_generation = self_writes.latest().map(|w| w.generation).unwrap_or(0);

        let monitor = Self {
            path: handle.path().to_path_buf(),
            directory,
            target,
            directory_id,
            config,
            self_writes,
            shutdown,
            events,
            sequence: 0,
            last_seen,
            consumed_generation,
        };

        log::info!("Watching {} for changes", monitor.path.display());
        Ok(tokio::spawn(monitor.run(watcher, raw_tx, raw_rx)))
    }

    async fn run(
        mut self,
        mut watcher: RecommendedWatcher,
        raw_tx: mpsc::UnboundedSender<Signal>,
        mut raw_rx: mpsc::UnboundedReceiver<Signal>,
    ) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let first = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = self.events.closed() => break,
                signal = raw_rx.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            let mut batch = Batch::default();
            batch.absorb(first, &self.directory, &self.target);

            tokio::select! {
                _ = tokio::time::sleep(self.config.debounce()) => {}
                _ = self.shutdown.changed() => break,
                _ = self.events.closed() => break,
            }
            while let Ok(signal) = raw_rx.try_recv() {
                batch.absorb(signal, &self.directory, &self.target);
            }

            if batch.failed || batch.directory_lost || self.directory_replaced().await {
                drop(watcher);
                if self.last_seen.take().is_some() && !self.deliver() {
                    break;
                }

                match self.restore(&raw_tx).await {
                    Ok(Restore::Restored(restored)) => {
                        watcher = restored;
                        while raw_rx.try_recv().is_ok() {}
                        self.last_seen = current_digest(&self.path).await.unwrap_or(None);
                        if !self.deliver() {
                            break;
                        }
                        continue;
                    }
                    Ok(Restore::Shutdown) => break,
                    Err(e) => {
                        log::error!("Giving up watching {}: {}", self.path.display(), e);
                        let _ = self.events.send(Err(e)).await;
                        return;
                    }
                }
            }

            if !self.evaluate(batch).await {
                break;
            }
        }

        log::debug!("Stopped watching {}", self.path.display());
    }

    /// Decide whether a batch is worth an event. Returns false once the
    /// subscriber has gone away.
    async fn evaluate(&mut self, batch: Batch) -> bool {
        let digest = match current_digest(&self.path).await {
            Ok(digest) => digest,
            Err(e) => {
                log::warn!("Failed to inspect {}: {}", self.path.display(), e);
                return self.deliver();
            }
        };

        if let Some(own) = digest
            .as_ref()
            .and_then(|d| self.self_writes.matching(d, self.consumed_generation))
        {
            self.consumed_generation = own.generation;
            self.last_seen = digest;
            log::debug!("Skipping notification for own write to {}", self.path.display());
            return true;
        }

        let changed = digest != self.last_seen;
        self.last_seen = digest;

        if changed || batch.recreated {
            return self.deliver();
        }
        if batch.renamed {
            // Our own replace can be evaluated before its rename event arrives
            let own_rename = digest.as_ref().is_some_and(|d| self.self_writes.wrote(d));
            if own_rename {
                log::debug!("Skipping late rename of own write to {}", self.path.display());
                return true;
            }
            return self.deliver();
        }
        true
    }

    /// True when the directory at our path is gone or is no longer the one
    /// the OS watch is attached to
    async fn directory_replaced(&self) -> bool {
        match directory_identity(&self.directory).await {
            Some(id) => Some(id) != self.directory_id,
            None => true,
        }
    }

    fn deliver(&mut self) -> bool {
        self.sequence += 1;
        match self.events.try_send(Ok(ChangeEvent::new(self.sequence))) {
            Ok(()) => {
                log::debug!("Change detected on {}", self.path.display());
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Subscriber already has a pending hint; this one folds into it
                self.sequence -= 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn restore(
        &mut self,
        raw_tx: &mpsc::UnboundedSender<Signal>,
    ) -> Result<Restore, ProviderError> {
        let retry = self.config.retry.clone();
        log::warn!(
            "Lost watch on {}, re-establishing",
            self.directory.display()
        );

        for attempt in 1..=retry.max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(retry.backoff(attempt)) => {}
                _ = self.shutdown.changed() => return Ok(Restore::Shutdown),
                _ = self.events.closed() => return Ok(Restore::Shutdown),
            }

            let Some(id) = directory_identity(&self.directory).await else {
                log::debug!(
                    "Attempt {}: {} is still missing",
                    attempt,
                    self.directory.display()
                );
                continue;
            };

            match establish(&self.directory, raw_tx.clone()) {
                Ok(watcher) => {
                    self.directory_id = Some(id);
                    log::info!(
                        "Re-established watch on {} after {} attempt(s)",
                        self.directory.display(),
                        attempt
                    );
                    return Ok(Restore::Restored(watcher));
                }
                Err(e) => log::warn!("Attempt {}: {}", attempt, e),
            }
        }

        Err(ProviderError::Watch(format!(
            "could not re-establish watch on {} after {} attempts",
            self.directory.display(),
            retry.max_attempts
        )))
    }
}

fn establish(
    directory: &Path,
    tx: mpsc::UnboundedSender<Signal>,
) -> Result<RecommendedWatcher, ProviderError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let signal = match res {
            Ok(event) => Signal::Event(event),
            Err(e) => Signal::Failed(e.to_string()),
        };
        let _ = tx.send(signal);
    })
    .map_err(|e| ProviderError::Watch(format!("failed to create watcher: {}", e)))?;

    watcher
        .watch(directory, RecursiveMode::NonRecursive)
        .map_err(|e| {
            ProviderError::Watch(format!("failed to watch {}: {}", directory.display(), e))
        })?;

    Ok(watcher)
}

#[cfg(unix)]
type DirectoryId = (u64, u64);
#[cfg(not(unix))]
type DirectoryId = ();

#[cfg(unix)]
fn directory_id(metadata: &std::fs::Metadata) -> DirectoryId {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn directory_id(_metadata: &std::fs::Metadata) -> DirectoryId {}

/// Identity of the directory currently at `directory`, if there is one
async fn directory_identity(directory: &Path) -> Option<DirectoryId> {
    match tokio::fs::metadata(directory).await {
        Ok(metadata) if metadata.is_dir() => Some(directory_id(&metadata)),
        _ => None,
    }
}

async fn current_digest(path: &Path) -> io::Result<Option<DocumentDigest>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(digest_bytes(&data))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
