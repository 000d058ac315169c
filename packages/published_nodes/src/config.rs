//! Provider configuration
//!
//! Resolving where the published nodes file lives happens here, at the
//! construction boundary, so providers never consult the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::document::EMPTY_PUBLISHED_NODES;
use crate::storage::{ProviderError, PublishedNodesDocument};

/// Environment variable naming the published nodes file
pub const PUBLISHED_NODES_FILE_ENV: &str = "PUBLISHED_NODES_FILE";

/// Environment variable enabling a default empty document when the file is absent
pub const CREATE_IF_MISSING_ENV: &str = "PUBLISHED_NODES_CREATE_IF_MISSING";

/// File name used when nothing else is configured
pub const DEFAULT_PUBLISHED_NODES_FILE: &str = "publishednodes.json";

/// What `read` does when the document does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingFilePolicy {
    /// Fail with `NotFound`
    #[default]
    Fail,
    /// Return the configured default document
    UseDefault,
}

/// Which storage backend to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A file on the local filesystem
    File { path: PathBuf },
    /// Process memory, optionally starting with some content
    Memory {
        #[serde(default)]
        initial: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from(DEFAULT_PUBLISHED_NODES_FILE),
        }
    }
}

/// Backoff used when a lost OS-level watch is re-established
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Watch tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Window during which bursts of filesystem events fold into one
    pub debounce_ms: u64,
    /// Undelivered events buffered per subscription before coalescing
    pub event_buffer: usize,
    pub retry: RetryConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            event_buffer: 16,
            retry: RetryConfig::default(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// How hard a file read tries to get a consistent view of a document that
/// someone else is rewriting in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Reads attempted before giving up with an I/O error
    pub max_attempts: u32,
    /// A file modified more recently than this is checked again after the
    /// same delay before its content is trusted
    pub settle_ms: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            settle_ms: 20,
        }
    }
}

impl ReadConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Configuration for building a published nodes provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub backend: BackendConfig,
    pub missing_file: MissingFilePolicy,
    /// Content served under `UseDefault` and written by seeding
    pub default_document: String,
    /// Whether a write may create the document when it is absent
    pub create_on_write: bool,
    /// Seed `default_document` when the provider is built and nothing exists
    pub seed_on_start: bool,
    pub read: ReadConfig,
    pub watch: WatchConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            missing_file: MissingFilePolicy::Fail,
            default_document: EMPTY_PUBLISHED_NODES.to_string(),
            create_on_write: true,
            seed_on_start: false,
            read: ReadConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// File-backed configuration with defaults for everything else
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::File { path: path.into() },
            ..Self::default()
        }
    }

    /// In-memory configuration, used by tests
    pub fn in_memory(initial: Option<String>) -> Self {
        Self {
            backend: BackendConfig::Memory { initial },
            ..Self::default()
        }
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self, ProviderError> {
        let data = std::fs::read(path).map_err(|e| {
            ProviderError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            ProviderError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Build a configuration from the process environment
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(PUBLISHED_NODES_FILE_ENV) {
            if path.trim().is_empty() {
                return Err(ProviderError::Config(format!(
                    "{} is set but empty",
                    PUBLISHED_NODES_FILE_ENV
                )));
            }
            config.backend = BackendConfig::File {
                path: PathBuf::from(path),
            };
        }

        if let Some(value) = lookup(CREATE_IF_MISSING_ENV) {
            if parse_flag(CREATE_IF_MISSING_ENV, &value)? {
                config = config.create_if_missing();
            }
        }

        Ok(config)
    }

    /// Serve and seed the default document when the file is absent
    pub fn create_if_missing(mut self) -> Self {
        self.missing_file = MissingFilePolicy::UseDefault;
        self.seed_on_start = true;
        self
    }

    pub fn default_document(&self) -> PublishedNodesDocument {
        PublishedNodesDocument::from(self.default_document.clone())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ProviderError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ProviderError::Config(format!(
            "{} must be a boolean, got {:?}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(
            config.backend,
            BackendConfig::File {
                path: PathBuf::from("publishednodes.json")
            }
        );
        assert_eq!(config.missing_file, MissingFilePolicy::Fail);
        assert_eq!(config.default_document(), PublishedNodesDocument::empty());
        assert!(config.create_on_write);
        assert!(!config.seed_on_start);
        assert_eq!(config.read.max_attempts, 8);
        assert_eq!(config.read.settle(), Duration::from_millis(20));
    }

    #[test]
    fn test_from_lookup() {
        let config = ProviderConfig::from_lookup(lookup_from(&[
            (PUBLISHED_NODES_FILE_ENV, "/data/pn.json"),
            (CREATE_IF_MISSING_ENV, "TRUE"),
        ]))
        .unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::File {
                path: PathBuf::from("/data/pn.json")
            }
        );
        assert_eq!(config.missing_file, MissingFilePolicy::UseDefault);
        assert!(config.seed_on_start);

        let config = ProviderConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ProviderConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = ProviderConfig::from_lookup(lookup_from(&[(CREATE_IF_MISSING_ENV, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));

        let err = ProviderConfig::from_lookup(lookup_from(&[(PUBLISHED_NODES_FILE_ENV, "  ")]))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.json");
        std::fs::write(
            &path,
            r#"{
                "backend": { "kind": "file", "path": "/opt/publisher/pn.json" },
                "missing_file": "use_default",
                "watch": { "debounce_ms": 250, "retry": { "max_attempts": 3 } }
            }"#,
        )
        .unwrap();

        let config = ProviderConfig::from_json_file(&path).unwrap();
        assert_eq!(config.missing_file, MissingFilePolicy::UseDefault);
        assert_eq!(config.watch.debounce(), Duration::from_millis(250));
        assert_eq!(config.watch.event_buffer, 16);
        assert_eq!(config.watch.retry.max_attempts, 3);
        assert_eq!(config.watch.retry.initial_backoff_ms, 100);
        assert_eq!(config.default_document, "[]");

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ProviderConfig::from_json_file(&path),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }
}
