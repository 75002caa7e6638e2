//! Typed configuration with defaults.
//!
//! Options may be overridden from an optional JSON file; a missing file
//! means pure defaults. The config is constructed at startup and passed
//! down explicitly so several cores can coexist in one process (tests rely
//! on this).

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime options for a messenger core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port the listener binds to.
    pub listen_port: u16,
    /// Dial timeout in seconds.
    pub connect_timeout_s: u64,
    /// Hard deadline for the whole handshake, in seconds.
    pub handshake_timeout_s: u64,
    /// Outbound silence before a heartbeat is sent, in seconds. No inbound
    /// frame for three intervals closes the session.
    pub heartbeat_interval_s: u64,
    /// Messages sent on the current key before a rekey is requested.
    pub rekey_msg_threshold: u64,
    /// Session-key age before a rekey is requested, in seconds.
    pub rekey_time_s: u64,
    /// Hard cap on a single wire frame.
    pub max_frame_bytes: u32,
    /// Hard cap on a transferable file.
    pub max_file_bytes: u64,
    /// Reconnect attempts after a transport error before giving up.
    pub reconnect_max_attempts: u32,
    /// Argon2id time cost for the vault key.
    pub argon2_time_cost: u32,
    /// Argon2id memory cost in KiB for the vault key.
    pub argon2_memory_kib: u32,
    /// Argon2id lane count for the vault key.
    pub argon2_parallelism: u32,
    /// Receive-counter replay window size in records.
    pub replay_window: u64,
    /// Root directory for vault, log database, attachments, and log files.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 5555,
            connect_timeout_s: 10,
            handshake_timeout_s: 10,
            heartbeat_interval_s: 30,
            rekey_msg_threshold: 1000,
            rekey_time_s: 86_400,
            max_frame_bytes: crate::MAX_FRAME_BYTES as u32,
            max_file_bytes: 10 * 1024 * 1024,
            reconnect_max_attempts: 5,
            argon2_time_cost: 2,
            argon2_memory_kib: 102_400,
            argon2_parallelism: 8,
            replay_window: 1024,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist. Unknown fields are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Io(format!("read config: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| StorageError::Io(format!("parse config: {e}")).into())
    }

    /// Directory holding the key vault files.
    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir.join("vault")
    }

    /// Path of the message-log database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("log").join("messages.db")
    }

    /// Root directory for received file attachments.
    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    /// Dial timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_s)
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    /// Maximum session-key age as a [`Duration`].
    pub fn rekey_time(&self) -> Duration {
        Duration::from_secs(self.rekey_time_s)
    }
}
