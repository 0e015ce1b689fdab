// ferrodb-core/src/config.rs
// Validated configuration tree
//
// The file-watching reloader belongs to the host process; the engine only
// defines the tree, defaults and schema validation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{FerroError, Result};

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
    pub transaction: TransactionConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Maximum wire-frame payload in bytes. Frames above this are rejected
    /// before any payload byte is decoded.
    pub max_payload_bytes: u32,
    pub tls_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 6772,
            max_payload_bytes: 10 * 1024 * 1024, // 10 MiB
            tls_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// When false the router runs with a permissive SecurityContext.
    pub enabled: bool,
    pub allow_anonymous_reads: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            enabled: false,
            allow_anonymous_reads: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_path: PathBuf,
    pub write_queue_workers: usize,
    pub write_queue_capacity: usize,
    /// Allow recovery to skip a CRC-damaged WAL record and keep replaying.
    /// When false a damaged record fails recovery with CORRUPTED_LOG.
    pub skip_corrupted_wal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_path: PathBuf::from("./ferrodb-data"),
            write_queue_workers: 4,
            write_queue_capacity: 1024,
            skip_corrupted_wal: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub default_isolation: String,
    pub timeout_secs: u64,
    pub deadlock_interval_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            default_isolation: "read_committed".to_string(),
            timeout_secs: 60,
            deadlock_interval_ms: 200,
            lock_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub regex_cache_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            regex_cache_entries: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub btree_order: usize,
    pub wal_segment_max_bytes: u64,
    /// Unsynced records tolerated before a group fsync.
    pub wal_sync_watermark: usize,
    pub ttl_sweep_interval_secs: u64,
    pub cursor_timeout_secs: u64,
    pub cursor_default_batch: usize,
    pub regex_timeout_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            btree_order: 64,
            wal_segment_max_bytes: 64 * 1024 * 1024,
            wal_sync_watermark: 128,
            ttl_sweep_interval_secs: 60,
            cursor_timeout_secs: 600,
            cursor_default_batch: 100,
            regex_timeout_ms: 250,
        }
    }
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let config: Config = serde_json::from_value(json.clone())?;
        config.validate()?;
        Ok(config)
    }

    /// Schema validation, run at load time.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_payload_bytes == 0 {
            return Err(FerroError::Validation(
                "server.max_payload_bytes must be positive".into(),
            ));
        }
        if self.storage.write_queue_workers == 0 {
            return Err(FerroError::Validation(
                "storage.write_queue_workers must be at least 1".into(),
            ));
        }
        if self.storage.write_queue_capacity == 0 {
            return Err(FerroError::Validation(
                "storage.write_queue_capacity must be positive".into(),
            ));
        }
        if self.performance.btree_order < 3 {
            return Err(FerroError::Validation(
                "performance.btree_order must be at least 3".into(),
            ));
        }
        if self.performance.wal_segment_max_bytes == 0 {
            return Err(FerroError::Validation(
                "performance.wal_segment_max_bytes must be positive".into(),
            ));
        }
        if self.performance.wal_sync_watermark == 0 {
            return Err(FerroError::Validation(
                "performance.wal_sync_watermark must be positive".into(),
            ));
        }
        if self.performance.regex_timeout_ms == 0 {
            return Err(FerroError::Validation(
                "performance.regex_timeout_ms must be positive".into(),
            ));
        }
        if self.transaction.deadlock_interval_ms == 0 {
            return Err(FerroError::Validation(
                "transaction.deadlock_interval_ms must be positive".into(),
            ));
        }
        crate::transaction::IsolationLevel::parse(&self.transaction.default_isolation).ok_or_else(
            || {
                FerroError::Validation(format!(
                    "transaction.default_isolation: unknown level '{}'",
                    self.transaction.default_isolation
                ))
            },
        )?;
        crate::logging::parse_level(&self.logging.level).ok_or_else(|| {
            FerroError::Validation(format!("logging.level: unknown level '{}'", self.logging.level))
        })?;
        Ok(())
    }
}
