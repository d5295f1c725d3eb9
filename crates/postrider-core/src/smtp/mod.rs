//! Outbound SMTP plumbing
//!
//! Every protocol outcome is an explicit value: a send either yields an
//! [`SmtpReply`] or an [`SmtpFailure`], never an exception side channel, so
//! the delivery state machine can match exhaustively. The [`SmtpSession`] /
//! [`SessionFactory`] traits are the seam between the engine and the wire;
//! production uses the lettre-backed implementation in [`client`], tests
//! substitute scripted sessions.

pub mod client;
pub mod pool;

use async_trait::async_trait;
use std::fmt;

pub use client::{LettreSession, LettreSessionFactory};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};

/// A positive SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub message: String,
}

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server answered with a negative reply.
    Response,
    /// The TCP connection could not be established.
    Connect,
    /// A command or connect timed out.
    Timeout,
    /// TLS negotiation failed.
    Tls,
    /// The connection broke mid-transaction.
    Io,
}

/// A failed SMTP interaction, carrying whatever reply code the server gave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpFailure {
    pub code: Option<u16>,
    pub message: String,
    pub kind: FailureKind,
}

impl SmtpFailure {
    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            kind: FailureKind::Connect,
        }
    }

    pub fn response(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            kind: FailureKind::Response,
        }
    }
}

impl fmt::Display for SmtpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SmtpFailure {}

/// Envelope addresses for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEnvelope {
    pub from: String,
    pub to: String,
}

/// An authenticated session to the outbound server.
///
/// A session is owned by exactly one caller at a time; the pool enforces
/// exclusivity.
#[async_trait]
pub trait SmtpSession: Send {
    /// Transmit one message; the raw bytes must already be a complete
    /// RFC 5322 message.
    async fn send(
        &mut self,
        envelope: &MailEnvelope,
        message: &[u8],
    ) -> Result<SmtpReply, SmtpFailure>;

    /// Cheap liveness probe for idle-session reuse.
    async fn is_alive(&mut self) -> bool;

    /// Close the session, politely if possible.
    async fn close(&mut self);
}

/// Opens new authenticated sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: SmtpSession + 'static;

    async fn connect(&self) -> Result<Self::Session, SmtpFailure>;
}
