//! Durable error ledger.
//!
//! Per-item delivery failures never reach the code that executed the action.
//! They are recorded here instead, one entry per failed action, and the
//! synchronizer carries on with the rest of the batch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::types::{ActionId, Identity, Service};

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// RFC 3339 timestamp of when the failure was recorded
    pub ts: String,
    pub identity: Identity,
    pub service: Service,
    pub action_id: ActionId,
    pub action_type: String,
    /// Error kind tag, e.g. "response CONTENT" or "reversal"
    pub kind: String,
    pub message: String,
}

impl LedgerEntry {
    pub fn new(
        identity: Identity,
        service: Service,
        action_id: ActionId,
        action_type: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            identity,
            service,
            action_id,
            action_type: action_type.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

pub trait ErrorLedger: Send + Sync {
    fn record(&self, entry: LedgerEntry) -> SyncResult<()>;
}

/// Ledger appending JSON lines to a single file.
pub struct JsonlErrorLedger {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JsonlErrorLedger {
    /// Open (or create) the ledger file in append mode.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry back, skipping lines that fail to parse.
    pub fn read_entries(path: impl AsRef<Path>) -> SyncResult<Vec<LedgerEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match LedgerEntry::from_json_line(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping bad ledger line"),
            }
        }
        Ok(entries)
    }
}

impl ErrorLedger for JsonlErrorLedger {
    fn record(&self, entry: LedgerEntry) -> SyncResult<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlErrorLedger {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

/// Ledger kept in memory, for embedding and tests.
#[derive(Default)]
pub struct MemoryErrorLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ErrorLedger for MemoryErrorLedger {
    fn record(&self, entry: LedgerEntry) -> SyncResult<()> {
        self.entries.lock().push(entry);
        Ok(())
    }
}
