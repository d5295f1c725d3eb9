//! Common types for postrider

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable identifier of a roster row, used for status write-back.
pub type RecordId = usize;

/// The three personalization slots a roster row may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVars {
    #[serde(default)]
    pub var1: String,
    #[serde(default)]
    pub var2: String,
    #[serde(default)]
    pub var3: String,
}

impl TemplateVars {
    /// True when every slot is empty.
    pub fn is_empty(&self) -> bool {
        self.var1.is_empty() && self.var2.is_empty() && self.var3.is_empty()
    }
}

/// One row of the recipient roster.
///
/// Owned by the recipient source; the engine reads it and reports a terminal
/// status back, never retaining it beyond one delivery cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: RecordId,
    pub email: String,
    pub vars: TemplateVars,
    /// Attachment file names, at most two per row.
    pub attachments: Vec<String>,
    /// Whether a previous run already delivered this row.
    pub sent: bool,
}

/// Status written back to the recipient source after a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    Failed,
}

/// Outcome of a single transmission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// The failure is worth retrying; carries the classified reason.
    Retryable(String),
    /// The failure ends delivery for this recipient.
    Fatal(String),
}

/// One entry in the per-recipient audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// 1-based attempt index.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Wall-clock time the attempt took.
    pub latency: Duration,
}

/// Terminal state of one recipient after a run.
///
/// `PermanentlyFailed` and `Exhausted` stay distinct so reporting can tell a
/// definitive rejection from a spent retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TerminalStatus {
    Success,
    /// Pre-send validation failed; no network attempt was made.
    Rejected(Vec<String>),
    /// Definitive rejection (permanent error class or hard bounce).
    PermanentlyFailed(String),
    /// Retry budget spent without success; carries the attempt count.
    Exhausted(u32),
}

impl TerminalStatus {
    /// Collapse to the binary status the roster understands.
    pub fn send_status(&self) -> SendStatus {
        match self {
            TerminalStatus::Success => SendStatus::Sent,
            _ => SendStatus::Failed,
        }
    }
}

/// Everything reported for one recipient at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub record_id: RecordId,
    pub email: String,
    pub status: TerminalStatus,
    pub attempts: Vec<DeliveryAttempt>,
}

impl RecipientOutcome {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}
