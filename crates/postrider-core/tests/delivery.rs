//! End-to-end delivery scenarios against a scripted mock SMTP session.

use async_trait::async_trait;
use postrider_common::types::{RecipientRecord, TemplateVars, TerminalStatus};
use postrider_core::backoff::BackoffSchedule;
use postrider_core::delivery::{DeliveryEngine, DeliveryOptions};
use postrider_core::message::{MessageBuilder, SenderIdentity};
use postrider_core::smtp::{
    ConnectionPool, FailureKind, MailEnvelope, PoolConfig, SessionFactory, SmtpFailure, SmtpReply,
    SmtpSession,
};
use postrider_core::template::TemplateRenderer;
use postrider_core::validate::PreSendValidator;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reply for a recipient: either a positive code or a failure.
#[derive(Clone)]
enum Scripted {
    Accept(u16),
    Reject(u16, &'static str),
}

/// Shared script: per-recipient reply sequences, consumed in order.
#[derive(Clone, Default)]
struct Script {
    replies: Arc<Mutex<HashMap<String, Vec<Scripted>>>>,
    sends_seen: Arc<Mutex<Vec<String>>>,
}

impl Script {
    fn set(&self, email: &str, replies: Vec<Scripted>) {
        self.replies
            .lock()
            .unwrap()
            .insert(email.to_string(), replies);
    }

    fn sends_to(&self, email: &str) -> usize {
        self.sends_seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == email)
            .count()
    }
}

struct ScriptedSession {
    script: Script,
}

#[async_trait]
impl SmtpSession for ScriptedSession {
    async fn send(
        &mut self,
        envelope: &MailEnvelope,
        _message: &[u8],
    ) -> Result<SmtpReply, SmtpFailure> {
        self.script
            .sends_seen
            .lock()
            .unwrap()
            .push(envelope.to.clone());

        let next = {
            let mut replies = self.script.replies.lock().unwrap();
            let queue = replies
                .get_mut(&envelope.to)
                .unwrap_or_else(|| panic!("no script for {}", envelope.to));
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        };

        match next {
            Scripted::Accept(code) => Ok(SmtpReply {
                code,
                message: "OK".to_string(),
            }),
            Scripted::Reject(code, message) => Err(SmtpFailure {
                code: Some(code),
                message: message.to_string(),
                kind: FailureKind::Response,
            }),
        }
    }

    async fn is_alive(&mut self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

struct ScriptedFactory {
    script: Script,
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    type Session = ScriptedSession;

    async fn connect(&self) -> Result<Self::Session, SmtpFailure> {
        Ok(ScriptedSession {
            script: self.script.clone(),
        })
    }
}

fn record(id: usize, email: &str) -> RecipientRecord {
    RecipientRecord {
        id,
        email: email.to_string(),
        vars: TemplateVars {
            var1: "Friend".to_string(),
            ..Default::default()
        },
        attachments: Vec::new(),
        sent: false,
    }
}

fn engine_for(script: Script, max_attempts: u32, dry_run: bool) -> Arc<DeliveryEngine<ScriptedFactory>> {
    let pool = Arc::new(ConnectionPool::new(
        ScriptedFactory {
            script: script.clone(),
        },
        PoolConfig {
            max_connections: 2,
            rotate_after_sends: 50,
        },
    ));
    let renderer = Arc::new(TemplateRenderer::new(
        "Hello {{var1}}",
        "Dear {{var1}},\n\nThis message confirms your registration details are on file.\n",
        None,
        "Sender",
    ));
    let builder = Arc::new(MessageBuilder::new(
        SenderIdentity {
            address: "mailer@example.com".to_string(),
            name: Some("Mailer".to_string()),
            reply_to: None,
            unsubscribe_address: Some("stop@example.com".to_string()),
            unsubscribe_url: None,
        },
        None,
        true,
    ));
    let validator = Arc::new(PreSendValidator::new(None));
    let schedule = BackoffSchedule {
        base_delay_secs: 0,
        max_delay_secs: 0,
        jitter_fraction: 0.0,
        max_attempts,
    };
    let options = DeliveryOptions {
        batch_size: 10,
        batch_delay: Duration::ZERO,
        per_message_delay: Duration::ZERO,
        workers: 2,
        dry_run,
        reject_on_failure: true,
        unsubscribe_footer: None,
        attachments_dir: PathBuf::from("attachments"),
    };
    Arc::new(DeliveryEngine::new(
        pool,
        renderer,
        builder,
        Some(validator),
        schedule,
        options,
    ))
}

fn status_of<'a>(
    outcomes: &'a [postrider_common::types::RecipientOutcome],
    email: &str,
) -> &'a postrider_common::types::RecipientOutcome {
    outcomes
        .iter()
        .find(|o| o.email == email)
        .unwrap_or_else(|| panic!("no outcome for {}", email))
}

// Paused clock: the rate-limit delay floor is minutes of virtual time.
#[tokio::test(start_paused = true)]
async fn mixed_outcomes_across_three_recipients() {
    let script = Script::default();
    script.set("ok@example.com", vec![Scripted::Accept(250)]);
    script.set(
        "gone@example.com",
        vec![Scripted::Reject(550, "No such user")],
    );
    script.set(
        "busy@example.com",
        vec![
            Scripted::Reject(421, "Too many connections"),
            Scripted::Accept(250),
        ],
    );

    let engine = engine_for(script.clone(), 5, false);
    let report = engine
        .run(vec![
            record(0, "ok@example.com"),
            record(1, "gone@example.com"),
            record(2, "busy@example.com"),
        ])
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 3);

    let ok = status_of(&report.outcomes, "ok@example.com");
    assert_eq!(ok.status, TerminalStatus::Success);
    assert_eq!(ok.attempt_count(), 1);

    let gone = status_of(&report.outcomes, "gone@example.com");
    assert!(matches!(gone.status, TerminalStatus::PermanentlyFailed(_)));
    // A hard bounce never retries, even with budget left.
    assert_eq!(gone.attempt_count(), 1);
    assert_eq!(script.sends_to("gone@example.com"), 1);

    let busy = status_of(&report.outcomes, "busy@example.com");
    assert_eq!(busy.status, TerminalStatus::Success);
    // Exactly two attempts with one intervening backoff.
    assert_eq!(busy.attempt_count(), 2);
    assert_eq!(script.sends_to("busy@example.com"), 2);

    let summary = report.summary();
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.permanently_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_is_distinct_from_rejection() {
    let script = Script::default();
    script.set(
        "deferred@example.com",
        vec![Scripted::Reject(451, "try again later")],
    );

    let engine = engine_for(script.clone(), 3, false);
    let report = engine
        .run(vec![record(0, "deferred@example.com")])
        .await
        .unwrap();

    let outcome = status_of(&report.outcomes, "deferred@example.com");
    assert_eq!(outcome.status, TerminalStatus::Exhausted(3));
    assert_eq!(outcome.attempt_count(), 3);
    assert_eq!(script.sends_to("deferred@example.com"), 3);
}

#[tokio::test]
async fn auth_failure_is_terminal_without_bounce() {
    let script = Script::default();
    script.set(
        "anyone@example.com",
        vec![Scripted::Reject(535, "Authentication credentials invalid")],
    );

    let engine = engine_for(script.clone(), 5, false);
    let report = engine
        .run(vec![record(0, "anyone@example.com")])
        .await
        .unwrap();

    let outcome = status_of(&report.outcomes, "anyone@example.com");
    match &outcome.status {
        TerminalStatus::PermanentlyFailed(reason) => {
            assert!(reason.contains("auth_failure"), "{}", reason)
        }
        other => panic!("expected PermanentlyFailed, got {:?}", other),
    }
    assert_eq!(script.sends_to("anyone@example.com"), 1);
}

#[tokio::test]
async fn invalid_address_is_rejected_before_any_send() {
    let script = Script::default();

    let engine = engine_for(script.clone(), 3, false);
    let report = engine.run(vec![record(0, "not-an-address")]).await.unwrap();

    let outcome = &report.outcomes[0];
    assert!(matches!(outcome.status, TerminalStatus::Rejected(_)));
    assert_eq!(outcome.attempt_count(), 0);
    assert!(script.sends_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_reports_success_without_transactions() {
    let script = Script::default();

    let engine = engine_for(script.clone(), 3, true);
    let report = engine
        .run(vec![
            record(0, "a@example.com"),
            record(1, "b@example.com"),
        ])
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.summary().sent, 2);
    for outcome in &report.outcomes {
        assert_eq!(outcome.status, TerminalStatus::Success);
        assert_eq!(outcome.attempt_count(), 1);
    }
    assert!(script.sends_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_stops_new_dispatches() {
    let script = Script::default();
    for i in 0..20 {
        script.set(&format!("r{}@example.com", i), vec![Scripted::Accept(250)]);
    }

    let engine = engine_for(script.clone(), 3, false);
    engine.cancellation_token().cancel();

    let records = (0..20)
        .map(|i| record(i, &format!("r{}@example.com", i)))
        .collect();
    let report = engine.run(records).await.unwrap();

    assert!(report.outcomes.is_empty());
    assert!(script.sends_seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn soft_bounce_keeps_retrying_until_success() {
    let script = Script::default();
    script.set(
        "full@example.com",
        vec![
            Scripted::Reject(452, "mailbox full"),
            Scripted::Reject(452, "mailbox full"),
            Scripted::Accept(250),
        ],
    );

    let engine = engine_for(script.clone(), 5, false);
    let report = engine.run(vec![record(0, "full@example.com")]).await.unwrap();

    let outcome = status_of(&report.outcomes, "full@example.com");
    assert_eq!(outcome.status, TerminalStatus::Success);
    assert_eq!(outcome.attempt_count(), 3);
}
