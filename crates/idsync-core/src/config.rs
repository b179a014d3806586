//! Runtime configuration.
//!
//! Every tunable of the synchronizer, the packet codec and the transport
//! lives in [`SyncConfig`]. Values can be loaded from a JSON file; fields
//! that are absent keep their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Well-known TCP port hosts listen on.
pub const DEFAULT_HOST_PORT: u16 = 7_143;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker threads kept alive for senders
    pub min_workers: usize,
    /// Upper bound the worker pool may grow to
    pub max_workers: usize,
    /// Fixed backlog of queued senders before the pool reports saturation
    pub worker_backlog: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Envelopes older than this are rejected
    pub replay_window_ms: i64,
    /// Envelopes further ahead than this are rejected
    pub future_tolerance_ms: i64,
    /// Extra retention for replay records beyond the window
    pub replay_purge_margin_ms: i64,
    pub replay_purge_interval_ms: u64,

    /// How long a symmetric key lease is reused for one host
    pub key_lease_period_ms: i64,
    /// Redirect-driven resends allowed per request
    pub resend_limit: u8,
    /// Whether response signatures are cryptographically verified
    pub verify_responses: bool,
    /// Host side: commitments older than this must be rotated
    pub commitment_max_age_ms: i64,
    /// Content blocks at least this large are zstd-compressed
    pub compression_threshold: usize,

    pub host_port: u16,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub max_frame_bytes: usize,

    /// Bounded wait for running senders at shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_workers: 8,
            max_workers: 16,
            worker_backlog: 64,
            initial_backoff_ms: 100,
            max_backoff_ms: 60_000,
            replay_window_ms: 30 * 60 * 1_000,
            future_tolerance_ms: 60 * 1_000,
            replay_purge_margin_ms: 60 * 1_000,
            replay_purge_interval_ms: 5 * 60 * 1_000,
            key_lease_period_ms: 60 * 60 * 1_000,
            resend_limit: 5,
            verify_responses: true,
            commitment_max_age_ms: 7 * 24 * 60 * 60 * 1_000,
            compression_threshold: 128,
            host_port: DEFAULT_HOST_PORT,
            connect_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            max_frame_bytes: 16 * 1024 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| SyncError::Serialization(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> SyncResult<()> {
        if self.min_workers == 0 || self.max_workers < self.min_workers {
            return Err(SyncError::InvalidOperation(format!(
                "worker pool bounds {}..{} are invalid",
                self.min_workers, self.max_workers
            )));
        }
        if self.worker_backlog == 0 {
            return Err(SyncError::InvalidOperation(
                "worker backlog must be positive".to_string(),
            ));
        }
        if self.initial_backoff_ms == 0 || self.max_backoff_ms < self.initial_backoff_ms {
            return Err(SyncError::InvalidOperation(
                "backoff bounds are invalid".to_string(),
            ));
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Age past which replay records can be dropped.
    pub fn replay_retention_ms(&self) -> i64 {
        self.replay_window_ms + self.replay_purge_margin_ms
    }
}
