//! lettre-backed SMTP session
//!
//! Uses the low-level `AsyncSmtpConnection` rather than a per-send transport
//! so a session can be authenticated once, handed out repeatedly by the
//! pool, and retired on its rotation threshold.

use super::{FailureKind, MailEnvelope, SessionFactory, SmtpFailure, SmtpReply, SmtpSession};
use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use postrider_common::config::SmtpConfig;
use std::time::Duration;
use tracing::debug;

/// Phase an error happened in, for failure-kind mapping.
#[derive(Clone, Copy)]
enum Phase {
    Connect,
    Command,
}

/// Pull the first plausible reply code out of an error's rendering. lettre
/// keeps the code private on its error type, but renders it.
fn parse_reply_code(text: &str) -> Option<u16> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 2 < bytes.len() {
        if bytes[i].is_ascii_digit()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
            && (i == 0 || !bytes[i - 1].is_ascii_digit())
            && (i + 3 >= bytes.len() || !bytes[i + 3].is_ascii_digit())
        {
            let code = (u16::from(bytes[i] - b'0')) * 100
                + (u16::from(bytes[i + 1] - b'0')) * 10
                + u16::from(bytes[i + 2] - b'0');
            if (200..600).contains(&code) {
                return Some(code);
            }
        }
        i += 1;
    }
    None
}

fn failure_from_lettre(err: &lettre::transport::smtp::Error, phase: Phase) -> SmtpFailure {
    let message = err.to_string();
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_tls() {
        FailureKind::Tls
    } else if err.is_permanent() || err.is_transient() {
        FailureKind::Response
    } else {
        match phase {
            Phase::Connect => FailureKind::Connect,
            Phase::Command => FailureKind::Io,
        }
    };
    let code = if matches!(kind, FailureKind::Response) {
        parse_reply_code(&message)
    } else {
        None
    };
    SmtpFailure {
        code,
        message,
        kind,
    }
}

fn parse_address(raw: &str, role: &str) -> Result<Address, SmtpFailure> {
    raw.parse::<Address>()
        .map_err(|e| SmtpFailure::response(553, format!("invalid {} address '{}': {}", role, raw, e)))
}

/// One authenticated connection to the configured relay.
pub struct LettreSession {
    connection: AsyncSmtpConnection,
}

#[async_trait]
impl SmtpSession for LettreSession {
    async fn send(
        &mut self,
        envelope: &MailEnvelope,
        message: &[u8],
    ) -> Result<SmtpReply, SmtpFailure> {
        let from = parse_address(&envelope.from, "sender")?;
        let to = parse_address(&envelope.to, "recipient")?;
        let envelope = Envelope::new(Some(from), vec![to])
            .map_err(|e| SmtpFailure::response(553, format!("invalid envelope: {}", e)))?;

        let response = self
            .connection
            .send(&envelope, message)
            .await
            .map_err(|e| failure_from_lettre(&e, Phase::Command))?;

        let code = response
            .code()
            .to_string()
            .parse::<u16>()
            .unwrap_or_default();
        Ok(SmtpReply {
            code,
            message: response.message().collect::<Vec<&str>>().join(" "),
        })
    }

    async fn is_alive(&mut self) -> bool {
        self.connection.test_connected().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.connection.quit().await {
            debug!("QUIT failed, aborting connection: {}", e);
            self.connection.abort().await;
        }
    }
}

/// Opens and authenticates [`LettreSession`]s from the run configuration.
pub struct LettreSessionFactory {
    config: SmtpConfig,
    client_id: ClientId,
}

impl LettreSessionFactory {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            client_id: ClientId::default(),
        }
    }
}

#[async_trait]
impl SessionFactory for LettreSessionFactory {
    type Session = LettreSession;

    async fn connect(&self) -> Result<Self::Session, SmtpFailure> {
        let timeout = Some(Duration::from_secs(self.config.timeout_secs));

        debug!(
            "connecting to {}:{} (starttls: {})",
            self.config.host, self.config.port, self.config.starttls
        );

        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.config.host.as_str(), self.config.port),
            timeout,
            &self.client_id,
            None,
            None,
        )
        .await
        .map_err(|e| failure_from_lettre(&e, Phase::Connect))?;

        if self.config.starttls {
            if !connection.can_starttls() {
                connection.abort().await;
                return Err(SmtpFailure {
                    code: None,
                    message: "server does not advertise STARTTLS".to_string(),
                    kind: FailureKind::Tls,
                });
            }
            let tls = TlsParameters::new(self.config.host.clone())
                .map_err(|e| failure_from_lettre(&e, Phase::Connect))?;
            connection
                .starttls(tls, &self.client_id)
                .await
                .map_err(|e| failure_from_lettre(&e, Phase::Connect))?;
        }

        let credentials = Credentials::new(
            self.config.username.clone(),
            self.config.password.clone(),
        );
        connection
            .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .await
            .map_err(|e| failure_from_lettre(&e, Phase::Command))?;

        Ok(LettreSession { connection })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_code() {
        assert_eq!(
            parse_reply_code("permanent error (550): 5.1.1 no such user"),
            Some(550)
        );
        assert_eq!(parse_reply_code("transient error (421)"), Some(421));
        assert_eq!(parse_reply_code("connection refused"), None);
        // Enhanced status like 5.1.1 alone must not read as a reply code.
        assert_eq!(parse_reply_code("status 5.1.1"), None);
        // Out-of-range triples are skipped.
        assert_eq!(parse_reply_code("id 123 then 451 deferred"), Some(451));
    }

    #[test]
    fn test_parse_address_failure_is_permanent_syntax() {
        let err = parse_address("not-an-address", "recipient").unwrap_err();
        assert_eq!(err.code, Some(553));
        assert_eq!(err.kind, FailureKind::Response);
    }
}
