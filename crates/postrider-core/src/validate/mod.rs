//! Pre-send validation gate
//!
//! Runs every configured check over a rendered message plus the cached
//! sender-side context and aggregates the results into a [`Verdict`] without
//! short-circuiting, so one pass surfaces every problem at once. The
//! validator never mutates anything and never decides policy: the
//! orchestrator reads the verdict and chooses what to do with it.

pub mod content;
pub mod dns;

pub use content::ContentChecker;
pub use dns::DnsChecker;

use crate::message::RenderedMessage;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

/// Result of one named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum CheckStatus {
    Pass,
    Warning(String),
    Fail(String),
}

/// A named check with its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
}

/// Aggregated validation results for one message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Verdict {
    pub checks: Vec<CheckResult>,
}

impl Verdict {
    pub fn push(&mut self, name: impl Into<String>, status: CheckStatus) {
        self.checks.push(CheckResult {
            name: name.into(),
            status,
        });
    }

    pub fn merge(&mut self, checks: &[CheckResult]) {
        self.checks.extend_from_slice(checks);
    }

    /// True when no check failed (warnings allowed).
    pub fn passed(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| matches!(c.status, CheckStatus::Fail(_)))
            .collect()
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| matches!(c.status, CheckStatus::Warning(_)))
            .collect()
    }

    /// Failure messages, for terminal reporting.
    pub fn failure_messages(&self) -> Vec<String> {
        self.failures()
            .iter()
            .map(|c| match &c.status {
                CheckStatus::Fail(m) => format!("{}: {}", c.name, m),
                _ => c.name.clone(),
            })
            .collect()
    }
}

/// The pre-send validation gate for one run.
pub struct PreSendValidator {
    address_re: Regex,
    content: ContentChecker,
    dns: Option<Arc<DnsChecker>>,
}

impl PreSendValidator {
    pub fn new(dns: Option<Arc<DnsChecker>>) -> Self {
        Self {
            address_re: Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap(),
            content: ContentChecker::new(),
            dns,
        }
    }

    /// Syntactic address check, usable on its own for roster pre-screening.
    pub fn address_is_valid(&self, address: &str) -> bool {
        self.address_re.is_match(address.trim())
    }

    /// Run the per-message checks. Every check reports its own result; none
    /// aborts the others.
    pub fn validate_message(&self, message: &RenderedMessage) -> Verdict {
        let mut verdict = Verdict::default();

        if self.address_is_valid(&message.to) {
            verdict.push("address_syntax", CheckStatus::Pass);
        } else {
            verdict.push(
                "address_syntax",
                CheckStatus::Fail(format!("'{}' is not a valid address", message.to)),
            );
        }

        if message.missing_attachments.is_empty() {
            verdict.push("attachments", CheckStatus::Pass);
        } else {
            verdict.push(
                "attachments",
                CheckStatus::Fail(format!(
                    "unresolved attachment(s): {}",
                    message.missing_attachments.join(", ")
                )),
            );
        }

        let issues = self.content.check(&message.subject, &message.text_body);
        if issues.is_empty() {
            verdict.push("content", CheckStatus::Pass);
        } else {
            for issue in issues {
                verdict.push(
                    format!("content.{}", issue.rule),
                    CheckStatus::Warning(issue.detail),
                );
            }
        }

        verdict
    }

    /// The run-scoped sender-side checks (SPF/DMARC/DNSBL), cached across
    /// recipients.
    pub async fn sender_checks(&self) -> Vec<CheckResult> {
        match &self.dns {
            Some(dns) => dns.sender_checks().await.to_vec(),
            None => Vec::new(),
        }
    }
}
