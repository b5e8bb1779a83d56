use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PxvError, PxvResult};

/// Highest number of simultaneous saves a single import task may run.
pub const MAX_CONCURRENT_SAVES: usize = 3;

/// Top-level configuration (loaded from pixvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PxvConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub import: ImportConfig,
    pub keys: KeysConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the encrypted media tree
    pub root: PathBuf,
    /// Writable scratch area for cleartext awaiting encryption or export
    pub scratch_dir: PathBuf,
    /// Local (never cloud-backed) directory for encrypted previews
    pub preview_dir: PathBuf,
    /// Upper bound on waiting for a remote item to materialize
    pub materialize_timeout_secs: u64,
    /// Poll interval while waiting on materialization
    pub materialize_poll_ms: u64,
    /// S3-compatible store that remote-only items are hydrated from
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket holding the encrypted media tree
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Cipher stream format version used for new saves (1 or 2)
    pub format_version: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Persisted task list
    pub state_file: PathBuf,
    /// Simultaneous saves within one task (1..=3)
    pub max_concurrent_saves: usize,
    /// Glob patterns skipped when collecting media from directories
    pub exclude_patterns: Vec<String>,
    /// Whether hidden files are collected
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// File holding base64-encoded 256-bit key material
    pub key_file: Option<PathBuf>,
    /// Identifier the key is stored under (defaults to the key file stem)
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.local/share/pixvault/media"),
            scratch_dir: PathBuf::from("~/.cache/pixvault/scratch"),
            preview_dir: PathBuf::from("~/.cache/pixvault/previews"),
            materialize_timeout_secs: 60,
            materialize_poll_ms: 250,
            remote: None,
        }
    }
}

impl StorageConfig {
    pub fn materialize_timeout(&self) -> Duration {
        Duration::from_secs(self.materialize_timeout_secs)
    }

    pub fn materialize_poll(&self) -> Duration {
        Duration::from_millis(self.materialize_poll_ms)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "pixvault".into(),
            enforce_tls: false,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { format_version: 2 }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("~/.local/share/pixvault/tasks.json"),
            max_concurrent_saves: 1,
            exclude_patterns: Vec::new(),
            include_hidden: false,
        }
    }
}

impl ImportConfig {
    /// Concurrency actually used by the engine, clamped to `1..=MAX_CONCURRENT_SAVES`.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrent_saves.clamp(1, MAX_CONCURRENT_SAVES)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl PxvConfig {
    /// Reject settings that would make the storage or import layers misbehave.
    pub fn validate(&self) -> PxvResult<()> {
        if !matches!(self.crypto.format_version, 1 | 2) {
            return Err(PxvError::Config(format!(
                "crypto.format_version must be 1 or 2, got {}",
                self.crypto.format_version
            )));
        }
        if self.storage.materialize_timeout_secs == 0 {
            return Err(PxvError::Config(
                "storage.materialize_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.storage.materialize_poll_ms == 0 {
            return Err(PxvError::Config(
                "storage.materialize_poll_ms must be greater than zero".into(),
            ));
        }
        for pattern in &self.import.exclude_patterns {
            if pattern.trim().is_empty() {
                return Err(PxvError::Config(
                    "import.exclude_patterns must not contain empty patterns".into(),
                ));
            }
        }
        if self.import.max_concurrent_saves > MAX_CONCURRENT_SAVES {
            tracing::warn!(
                requested = self.import.max_concurrent_saves,
                max = MAX_CONCURRENT_SAVES,
                "import.max_concurrent_saves clamped"
            );
        }
        Ok(())
    }
}
