//! Run reporting
//!
//! A run always ends with a per-recipient outcome table, even when most
//! sends failed. The table keeps `PermanentlyFailed` and `Exhausted` apart
//! so definitive rejection and spent retry budget stay distinguishable.

use chrono::{DateTime, Utc};
use postrider_common::types::{RecipientOutcome, TerminalStatus};
use serde::Serialize;
use tracing::info;

/// Aggregate counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub sent: usize,
    pub rejected: usize,
    pub permanently_failed: usize,
    pub exhausted: usize,
}

/// The terminal outcome table for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub outcomes: Vec<RecipientOutcome>,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.outcomes.len(),
            ..Default::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                TerminalStatus::Success => summary.sent += 1,
                TerminalStatus::Rejected(_) => summary.rejected += 1,
                TerminalStatus::PermanentlyFailed(_) => summary.permanently_failed += 1,
                TerminalStatus::Exhausted(_) => summary.exhausted += 1,
            }
        }
        summary
    }

    /// Emit the outcome table and the summary line.
    pub fn log(&self) {
        for outcome in &self.outcomes {
            let attempts = outcome.attempt_count();
            match &outcome.status {
                TerminalStatus::Success => {
                    info!("{}: sent ({} attempt(s))", outcome.email, attempts);
                }
                TerminalStatus::Rejected(reasons) => {
                    info!("{}: rejected before send: {}", outcome.email, reasons.join("; "));
                }
                TerminalStatus::PermanentlyFailed(reason) => {
                    info!(
                        "{}: permanently failed after {} attempt(s): {}",
                        outcome.email, attempts, reason
                    );
                }
                TerminalStatus::Exhausted(max) => {
                    info!("{}: gave up after {} attempt(s)", outcome.email, max);
                }
            }
        }

        let summary = self.summary();
        let duration = self.finished_at - self.started_at;
        info!(
            "run finished{}: {} total, {} sent, {} rejected, {} permanently failed, {} exhausted ({}s)",
            if self.dry_run { " (dry run)" } else { "" },
            summary.total,
            summary.sent,
            summary.rejected,
            summary.permanently_failed,
            summary.exhausted,
            duration.num_seconds()
        );
    }

    /// Machine-readable form of the table.
    pub fn to_json(&self) -> postrider_common::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| postrider_common::Error::Other(anyhow::anyhow!(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postrider_common::types::RecipientOutcome;

    fn outcome(email: &str, status: TerminalStatus) -> RecipientOutcome {
        RecipientOutcome {
            record_id: 0,
            email: email.to_string(),
            status,
            attempts: Vec::new(),
        }
    }

    #[test]
    fn test_summary_counts_each_terminal_state() {
        let now = Utc::now();
        let report = RunReport {
            started_at: now,
            finished_at: now,
            dry_run: false,
            outcomes: vec![
                outcome("a@x.test", TerminalStatus::Success),
                outcome("b@x.test", TerminalStatus::Success),
                outcome("c@x.test", TerminalStatus::Rejected(vec!["bad".into()])),
                outcome("d@x.test", TerminalStatus::PermanentlyFailed("550".into())),
                outcome("e@x.test", TerminalStatus::Exhausted(3)),
            ],
        };
        let summary = report.summary();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(summary.exhausted, 1);
    }

    #[test]
    fn test_report_serializes() {
        let now = Utc::now();
        let report = RunReport {
            started_at: now,
            finished_at: now,
            dry_run: true,
            outcomes: vec![outcome("a@x.test", TerminalStatus::Success)],
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"dry_run\": true"));
        assert!(json.contains("a@x.test"));
    }
}
