use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from keyward.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub daemon: DaemonConfig,
    pub database: DatabaseConfig,
    pub kdf: KdfConfig,
    pub history: HistoryConfig,
    pub broker: BrokerConfig,
    /// Warn if the config file is world-readable (default: true)
    pub config_file_mode_check: bool,
}

impl Default for KeywardConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            database: DatabaseConfig::default(),
            kdf: KdfConfig::default(),
            history: HistoryConfig::default(),
            broker: BrokerConfig::default(),
            config_file_mode_check: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Container file opened by the daemon
    pub path: Option<PathBuf>,
    /// Key file combined with the password
    pub key_file: Option<PathBuf>,
    /// Keep the previous container as `<name>.old.kwdb` on save
    pub backup_on_save: bool,
    /// Open even if another process holds the lock (lock is then not held)
    pub lock_override: bool,
    /// Payload cipher for new databases: "aes256" or "chacha20"
    pub cipher: String,
    /// Payload compression for new databases: "zstd" or "none"
    pub compression: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            key_file: None,
            backup_on_save: true,
            lock_override: false,
            cipher: "aes256".into(),
            compression: "zstd".into(),
        }
    }
}

/// Key derivation parameters used when creating a database or rekeying
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// "argon2id", "argon2d" or "aes"
    pub algorithm: String,
    /// Argon2 memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2 time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2 parallelism (default: 2)
    pub argon2_parallelism: u32,
    /// AES-KDF transform rounds
    pub aes_rounds: u64,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            algorithm: "argon2id".into(),
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 2,
            aes_rounds: 600_000,
        }
    }
}

/// Entry history caps applied to new databases. Negative values disable a cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_items: i32,
    pub max_size: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_size: 6 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Unix socket the daemon listens on
    pub socket: PathBuf,
    /// Require the request scheme to match the entry URL scheme
    pub match_url_scheme: bool,
    /// Only return the best-ranked matches
    pub best_match_only: bool,
    /// Maximum age of a request timestamp, in seconds
    pub nonce_window_secs: u64,
    /// How long to wait for the user to answer a consent prompt
    pub consent_timeout_secs: u64,
    /// Return entries whose expiry time has passed
    pub allow_expired: bool,
    /// Save the database after the broker mutates it
    pub save_on_update: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("~/.local/share/keyward/broker.sock"),
            match_url_scheme: true,
            best_match_only: false,
            nonce_window_secs: 120,
            consent_timeout_secs: 60,
            allow_expired: false,
            save_on_update: true,
        }
    }
}
