//! Delivery orchestration
//!
//! Drives the per-recipient state machine:
//!
//! ```text
//! Pending -> Validating -> (Rejected | Sending)
//! Sending -> Success
//!         -> Retrying -> Sending            (transient / rate limited / connection)
//!         -> PermanentlyFailed              (permanent / auth / hard bounce)
//! Retrying -> Exhausted                     (attempt budget spent)
//! ```
//!
//! Recipients are processed in batches with an inter-batch pause; inside a
//! batch a bounded worker set sends back-to-back over pooled connections.
//! Workers only ever suspend on pool acquisition and on the backoff sleep.
//! Cancellation stops new dispatches and lets in-flight transactions finish
//! so no session is killed mid-command.

use crate::backoff::BackoffSchedule;
use crate::bounce::{self, BounceKind};
use crate::classify;
use crate::message::{self, MessageBuilder, RenderedMessage};
use crate::smtp::{ConnectionPool, SessionFactory, SmtpFailure};
use crate::template::{self, TemplateRenderer};
use crate::validate::PreSendValidator;
use chrono::Utc;
use postrider_common::types::{
    AttemptOutcome, DeliveryAttempt, RecipientOutcome, RecipientRecord, TerminalStatus,
};
use postrider_common::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::report::RunReport;

/// Per-run delivery options.
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub per_message_delay: Duration,
    pub workers: usize,
    pub dry_run: bool,
    /// Whether a failed validation check rejects the recipient.
    pub reject_on_failure: bool,
    /// Mailbox appended to bodies as an unsubscribe notice.
    pub unsubscribe_footer: Option<String>,
    pub attachments_dir: PathBuf,
}

/// The delivery orchestrator for one run.
pub struct DeliveryEngine<F: SessionFactory> {
    pool: Arc<ConnectionPool<F>>,
    renderer: Arc<TemplateRenderer>,
    builder: Arc<MessageBuilder>,
    validator: Option<Arc<PreSendValidator>>,
    schedule: BackoffSchedule,
    options: DeliveryOptions,
    cancel: CancellationToken,
}

impl<F: SessionFactory> DeliveryEngine<F> {
    pub fn new(
        pool: Arc<ConnectionPool<F>>,
        renderer: Arc<TemplateRenderer>,
        builder: Arc<MessageBuilder>,
        validator: Option<Arc<PreSendValidator>>,
        schedule: BackoffSchedule,
        options: DeliveryOptions,
    ) -> Self {
        Self {
            pool,
            renderer,
            builder,
            validator,
            schedule,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops dispatching new sends when cancelled; in-flight
    /// transactions finish naturally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Acquire, authenticate and release one connection without sending.
    pub async fn self_test(&self) -> Result<()> {
        self.pool
            .self_test()
            .await
            .map_err(|e| Error::Config(format!("connectivity self-test failed: {}", e)))
    }

    /// The cached sender-side verdict (SPF/DMARC/IP reputation).
    pub async fn sender_checks(&self) -> Vec<crate::validate::CheckResult> {
        match &self.validator {
            Some(validator) => validator.sender_checks().await,
            None => Vec::new(),
        }
    }

    /// Deliver every record and return the outcome table.
    pub async fn run(self: Arc<Self>, records: Vec<RecipientRecord>) -> Result<RunReport> {
        let started_at = Utc::now();
        let total = records.len();

        // Sender-side state is per-run, not per-recipient: check it once
        // before the first message goes out.
        if let Some(validator) = &self.validator {
            let sender_checks = validator.sender_checks().await;
            for check in &sender_checks {
                match &check.status {
                    crate::validate::CheckStatus::Warning(msg) => {
                        warn!("sender check {}: {}", check.name, msg)
                    }
                    crate::validate::CheckStatus::Fail(msg) => {
                        warn!("sender check {} failed: {}", check.name, msg)
                    }
                    crate::validate::CheckStatus::Pass => {}
                }
            }
            if self.options.reject_on_failure
                && sender_checks
                    .iter()
                    .any(|c| matches!(c.status, crate::validate::CheckStatus::Fail(_)))
            {
                return Err(Error::Validation(
                    "sender-side checks failed; aborting before any send".to_string(),
                ));
            }
        }

        info!(
            "dispatching {} recipient(s) in batches of {}{}",
            total,
            self.options.batch_size,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut outcomes = Vec::with_capacity(total);
        let batch_size = self.options.batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);

        for (batch_index, batch) in records.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                warn!("cancelled; {} recipient(s) left undispatched", total - outcomes.len());
                break;
            }

            debug!("batch {}/{} ({} recipient(s))", batch_index + 1, batch_count, batch.len());

            let mut handles = Vec::with_capacity(batch.len());
            for record in batch {
                if self.cancel.is_cancelled() {
                    break;
                }
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Smtp("worker semaphore closed".to_string()))?;
                let engine = self.clone();
                let record = record.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = engine.deliver_one(&record).await;
                    if !engine.options.per_message_delay.is_zero() {
                        tokio::time::sleep(engine.options.per_message_delay).await;
                    }
                    drop(permit);
                    outcome
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => warn!("delivery task panicked: {}", e),
                }
            }

            let last_batch = batch_index + 1 == batch_count;
            if !last_batch && !self.options.batch_delay.is_zero() && !self.cancel.is_cancelled() {
                debug!(
                    "batch pause: {}s",
                    self.options.batch_delay.as_secs_f64()
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.options.batch_delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            dry_run: self.options.dry_run,
            outcomes,
        };
        Ok(report)
    }

    /// Render the message for one record.
    async fn render(&self, record: &RecipientRecord) -> RenderedMessage {
        let subject = self.renderer.render_subject(&record.email, &record.vars);
        let mut text_body = self.renderer.render_body(&record.email, &record.vars);
        let mut html_body = self.renderer.render_html(&record.email, &record.vars);

        if let Some(mailto) = &self.options.unsubscribe_footer {
            text_body = template::unsubscribe_footer(&text_body, mailto, false);
            html_body = html_body.map(|h| template::unsubscribe_footer(&h, mailto, true));
        }

        let (attachments, missing_attachments) =
            message::resolve_attachments(&self.options.attachments_dir, &record.attachments).await;

        RenderedMessage {
            to: record.email.clone(),
            subject,
            text_body,
            html_body,
            attachments,
            missing_attachments,
        }
    }

    /// Run the full state machine for one recipient.
    async fn deliver_one(&self, record: &RecipientRecord) -> RecipientOutcome {
        let rendered = self.render(record).await;

        // Validating.
        if let Some(validator) = &self.validator {
            let verdict = validator.validate_message(&rendered);
            for check in verdict.warnings() {
                if let crate::validate::CheckStatus::Warning(msg) = &check.status {
                    warn!("{}: {} warning: {}", record.email, check.name, msg);
                }
            }
            if !verdict.passed() && self.options.reject_on_failure {
                let reasons = verdict.failure_messages();
                info!("{}: rejected before send: {}", record.email, reasons.join("; "));
                return RecipientOutcome {
                    record_id: record.id,
                    email: record.email.clone(),
                    status: TerminalStatus::Rejected(reasons),
                    attempts: Vec::new(),
                };
            }
        }

        // Building happens once; every retry transmits the same bytes under
        // the same Message-ID.
        let built = match self.builder.build(&rendered) {
            Ok(built) => built,
            Err(e) => {
                let reason = e.to_string();
                warn!("{}: message build failed: {}", record.email, reason);
                return RecipientOutcome {
                    record_id: record.id,
                    email: record.email.clone(),
                    status: TerminalStatus::Rejected(vec![reason]),
                    attempts: Vec::new(),
                };
            }
        };

        let mut attempts: Vec<DeliveryAttempt> = Vec::new();
        let max_attempts = self.schedule.max_attempts;

        // Sending/Retrying loop. The attempt number is threaded explicitly;
        // nothing ambient counts retries.
        for attempt in 1..=max_attempts {
            let started_at = Utc::now();
            let timer = Instant::now();

            if self.options.dry_run {
                debug!("{}: dry run, transaction skipped", record.email);
                attempts.push(DeliveryAttempt {
                    attempt,
                    started_at,
                    outcome: AttemptOutcome::Success,
                    latency: timer.elapsed(),
                });
                info!("{}: sent (dry run)", record.email);
                return self.success(record, attempts);
            }

            let failure = match self.attempt_send(record, &built).await {
                Ok(code) => {
                    attempts.push(DeliveryAttempt {
                        attempt,
                        started_at,
                        outcome: AttemptOutcome::Success,
                        latency: timer.elapsed(),
                    });
                    info!(
                        "{}: accepted with {} on attempt {} ({:?})",
                        record.email,
                        code,
                        attempt,
                        timer.elapsed()
                    );
                    return self.success(record, attempts);
                }
                Err(failure) => failure,
            };

            let classification = classify::classify(&failure);
            let bounce = bounce::interpret(&failure);
            warn!(
                "{}: attempt {}/{} failed ({}, bounce: {}): {}",
                record.email,
                attempt,
                max_attempts,
                classification.class.as_str(),
                bounce.kind.as_str(),
                failure
            );

            // A hard bounce is terminal no matter how much budget remains.
            if bounce.kind == BounceKind::Hard {
                attempts.push(DeliveryAttempt {
                    attempt,
                    started_at,
                    outcome: AttemptOutcome::Fatal(failure.to_string()),
                    latency: timer.elapsed(),
                });
                return self.failed(
                    record,
                    attempts,
                    format!("hard bounce: {} ({})", bounce.reason, failure),
                );
            }

            if !classification.retry {
                attempts.push(DeliveryAttempt {
                    attempt,
                    started_at,
                    outcome: AttemptOutcome::Fatal(failure.to_string()),
                    latency: timer.elapsed(),
                });
                return self.failed(
                    record,
                    attempts,
                    format!("{}: {}", classification.class.as_str(), failure),
                );
            }

            attempts.push(DeliveryAttempt {
                attempt,
                started_at,
                outcome: AttemptOutcome::Retryable(format!(
                    "{}: {}",
                    classification.class.as_str(),
                    failure
                )),
                latency: timer.elapsed(),
            });

            if attempt == max_attempts {
                info!(
                    "{}: retry budget of {} spent, giving up",
                    record.email, max_attempts
                );
                return RecipientOutcome {
                    record_id: record.id,
                    email: record.email.clone(),
                    status: TerminalStatus::Exhausted(max_attempts),
                    attempts,
                };
            }

            let mut delay = self.schedule.delay(attempt);
            if let Some(floor) = classification.delay_floor {
                delay = delay.max(floor);
            }
            debug!(
                "{}: backing off {:?} before attempt {}",
                record.email,
                delay,
                attempt + 1
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    info!("{}: cancelled while waiting to retry", record.email);
                    return RecipientOutcome {
                        record_id: record.id,
                        email: record.email.clone(),
                        status: TerminalStatus::Exhausted(attempt),
                        attempts,
                    };
                }
            }
        }

        // The loop always returns; max_attempts >= 1 is enforced by config
        // validation.
        RecipientOutcome {
            record_id: record.id,
            email: record.email.clone(),
            status: TerminalStatus::Exhausted(max_attempts),
            attempts,
        }
    }

    /// One transmission over a pooled connection, with the connection
    /// returned, retired or invalidated according to what happened.
    async fn attempt_send(
        &self,
        record: &RecipientRecord,
        built: &crate::message::BuiltMessage,
    ) -> std::result::Result<u16, SmtpFailure> {
        let mut conn = self.pool.acquire().await?;
        debug!(
            "{}: sending over session #{} ({} prior sends)",
            record.email,
            conn.id(),
            conn.sends()
        );

        match conn.send(&built.envelope, &built.bytes).await {
            Ok(reply) => {
                self.pool.release(conn, true).await;
                Ok(reply.code)
            }
            Err(failure) => {
                let classification = classify::classify(&failure);
                if classification.class.breaks_connection() {
                    self.pool.invalidate(conn).await;
                } else {
                    // The server answered in-protocol; the session is fine.
                    self.pool.release(conn, true).await;
                }
                Err(failure)
            }
        }
    }

    fn success(&self, record: &RecipientRecord, attempts: Vec<DeliveryAttempt>) -> RecipientOutcome {
        RecipientOutcome {
            record_id: record.id,
            email: record.email.clone(),
            status: TerminalStatus::Success,
            attempts,
        }
    }

    fn failed(
        &self,
        record: &RecipientRecord,
        attempts: Vec<DeliveryAttempt>,
        reason: String,
    ) -> RecipientOutcome {
        RecipientOutcome {
            record_id: record.id,
            email: record.email.clone(),
            status: TerminalStatus::PermanentlyFailed(reason),
            attempts,
        }
    }
}
