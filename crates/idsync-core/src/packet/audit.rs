//! Audit payloads. A request asks for everything since its cursor; the
//! response reports the host's new cursor and the foreign actions in between.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{ModuleId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAudit {
    /// The client's current sync cursor
    pub since: Timestamp,
}

/// A foreign action the host performed after the requested cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub time: Timestamp,
    /// Encoded action record
    pub record: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseAudit {
    /// New cursor for the client
    pub time: Timestamp,
    pub entries: Vec<AuditEntry>,
    /// Modules touched by the reported entries
    pub modules: BTreeSet<ModuleId>,
    /// Service state changed outside this client's pending actions
    pub state_mutated: bool,
}

impl ResponseAudit {
    /// An audit reporting nothing but the host time.
    pub fn empty(time: Timestamp) -> Self {
        Self {
            time,
            entries: Vec::new(),
            modules: BTreeSet::new(),
            state_mutated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.state_mutated
    }
}
