//! Append-only execution log.
//!
//! Every state transition of an instance appends one entry. Entries
//! carry a monotonically increasing sequence number and are never
//! rewritten or deleted, including across checkpoint restores.

use crate::model::step::StepId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One immutable record in an instance's execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub level: LogLevel,

    /// Step the entry relates to; `None` for instance-level events
    /// such as pause, resume, or checkpoint operations.
    pub step_id: Option<StepId>,

    pub message: String,

    /// Structured payload, e.g. an evaluated condition or an action
    /// error.
    pub details: Option<serde_json::Value>,
}

/// In-memory append-only log of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
    next_sequence: u64,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Append an entry and return its sequence number.
    pub fn append(
        &mut self,
        level: LogLevel,
        step_id: Option<StepId>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(LogEntry {
            sequence,
            timestamp: Utc::now(),
            level,
            step_id,
            message: message.into(),
            details,
        });
        sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence of the most recent entry, 0 when the log is empty.
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Full view of the log in order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries with sequence greater than `after`, capped at `limit`.
    /// Supports incremental tailing by callers.
    pub fn window(&self, after: u64, limit: usize) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.sequence > after)
            .take(limit)
            .cloned()
            .collect()
    }
}
