//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml
//!
//! Durations are stored as integer milliseconds so the TOML stays flat;
//! each settings struct exposes `Duration` accessors for the engine code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{FILE_CHUNK_SIZE, MAX_MESSAGE_CHUNKS, MESSAGE_CHUNK_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub messaging: MessagingSettings,
    pub file_transfer: FileTransferSettings,
    pub hole_punch: HolePunchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name this node registers under and reports to peers.
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP port for direct links. 0 = OS-assigned.
    pub bind_port: u16,
    /// SO_RCVBUF for UDP sockets, bytes. 0 = leave the OS default.
    pub udp_recv_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    pub chunk_size: usize,
    /// Upper bound on chunks per message. Values above 64 are clamped.
    pub max_chunks: u32,
    /// Retransmission timeout per unacknowledged chunk.
    pub rto_ms: u64,
    /// Retransmission scan period.
    pub tick_ms: u64,
    /// Resends allowed per chunk before the message fails.
    pub max_retries: u32,
    /// ACK debounce delay on the receiver.
    pub ack_delay_ms: u64,
    /// How long a completed message id is remembered for duplicate handling.
    pub completed_linger_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTransferSettings {
    pub chunk_size: usize,
    /// SYN → ACK deadline.
    pub handshake_timeout_ms: u64,
    /// SYN resend interval while waiting for ACK.
    pub syn_retry_ms: u64,
    /// UR_RECEIVER → OK_SNDFILE deadline.
    pub offer_timeout_ms: u64,
    /// UR_RECEIVER resend interval.
    pub offer_retry_ms: u64,
    /// Fixed delay between DATA packets.
    pub pacing_us: u64,
    /// Delay after the last DATA (or last NACK service) before FIN.
    pub settle_ms: u64,
    /// FIN resend interval while waiting for the receiver's confirmation.
    pub fin_retry_ms: u64,
    /// Post-FIN wait for the receiver's confirmation.
    pub completion_timeout_ms: u64,
    /// Receiver drops a transfer that has been silent this long.
    pub receive_idle_timeout_ms: u64,
    /// Files at least this large are received through mapped windows.
    pub windowed_threshold_bytes: u64,
    pub chunks_per_window: u32,
    pub max_windows: usize,
    /// Where accepted files are written.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchSettings {
    /// Rendezvous server, `host:port`. Empty = hole punching disabled.
    pub directory_addr: String,
    pub lookup_timeout_ms: u64,
    pub punch_timeout_ms: u64,
    pub hello_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: std::env::var("USER").unwrap_or_else(|_| "tether".to_string()),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_port: 0,
            udp_recv_buffer: 4 * 1024 * 1024,
        }
    }
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            chunk_size: MESSAGE_CHUNK_SIZE,
            max_chunks: MAX_MESSAGE_CHUNKS,
            rto_ms: 500,
            tick_ms: 100,
            max_retries: 5,
            ack_delay_ms: 50,
            completed_linger_ms: 10_000,
        }
    }
}

impl Default for FileTransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: FILE_CHUNK_SIZE,
            handshake_timeout_ms: 30_000,
            syn_retry_ms: 5_000,
            offer_timeout_ms: 60_000,
            offer_retry_ms: 2_000,
            pacing_us: 200,
            settle_ms: 100,
            fin_retry_ms: 5_000,
            completion_timeout_ms: 30_000,
            receive_idle_timeout_ms: 120_000,
            windowed_threshold_bytes: 256 * 1024 * 1024,
            chunks_per_window: 4096,
            max_windows: 8,
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for HolePunchSettings {
    fn default() -> Self {
        Self {
            directory_addr: String::new(),
            lookup_timeout_ms: 10_000,
            punch_timeout_ms: 15_000,
            hello_interval_ms: 500,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl MessagingSettings {
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    pub fn completed_linger(&self) -> Duration {
        Duration::from_millis(self.completed_linger_ms)
    }

    /// Chunk cap after clamping to the ACK bitmap width.
    pub fn chunk_limit(&self) -> u32 {
        self.max_chunks.clamp(1, MAX_MESSAGE_CHUNKS)
    }

    /// Largest payload a single message may carry.
    pub fn max_message_bytes(&self) -> usize {
        self.chunk_size * self.chunk_limit() as usize
    }
}

impl FileTransferSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn syn_retry(&self) -> Duration {
        Duration::from_millis(self.syn_retry_ms.max(1))
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn offer_retry(&self) -> Duration {
        Duration::from_millis(self.offer_retry_ms.max(1))
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_micros(self.pacing_us)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn fin_retry(&self) -> Duration {
        Duration::from_millis(self.fin_retry_ms.max(1))
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn receive_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_idle_timeout_ms)
    }
}

impl HolePunchSettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn punch_timeout(&self) -> Duration {
        Duration::from_millis(self.punch_timeout_ms)
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` is the environment in production;
    /// tests pass a map so they never touch process state.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TETHER_IDENTITY__USERNAME") {
            self.identity.username = v;
        }
        if let Some(p) = lookup("TETHER_NETWORK__BIND_PORT").and_then(|v| v.parse().ok()) {
            self.network.bind_port = p;
        }
        if let Some(v) = lookup("TETHER_HOLE_PUNCH__DIRECTORY_ADDR") {
            self.hole_punch.directory_addr = v;
        }
        if let Some(v) = lookup("TETHER_FILE_TRANSFER__DOWNLOAD_DIR") {
            self.file_transfer.download_dir = PathBuf::from(v);
        }
        if let Some(ms) = lookup("TETHER_MESSAGING__RTO_MS").and_then(|v| v.parse().ok()) {
            self.messaging.rto_ms = ms;
        }
        if let Some(n) = lookup("TETHER_MESSAGING__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.messaging.max_retries = n;
        }
        if let Some(us) = lookup("TETHER_FILE_TRANSFER__PACING_US").and_then(|v| v.parse().ok()) {
            self.file_transfer.pacing_us = us;
        }
    }
}
