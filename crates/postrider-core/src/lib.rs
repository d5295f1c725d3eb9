//! postrider core - the bulk mail delivery engine
//!
//! This crate provides the delivery engine: a connection-pooled SMTP
//! dispatcher with classification-driven retries, bounce interpretation, a
//! compliance-complete message builder with optional DKIM signing, and a
//! pre-send validation gate.

pub mod backoff;
pub mod bounce;
pub mod classify;
pub mod delivery;
pub mod message;
pub mod roster;
pub mod smtp;
pub mod template;
pub mod validate;

pub use backoff::BackoffSchedule;
pub use bounce::{Bounce, BounceKind};
pub use classify::{Classification, ErrorClass};
pub use delivery::{DeliveryEngine, DeliveryOptions, RunReport, RunSummary};
pub use message::{BuiltMessage, DkimSigner, DkimSigningConfig, MessageBuilder, SenderIdentity};
pub use roster::{CsvRoster, RecipientSource};
pub use smtp::{ConnectionPool, LettreSessionFactory, MailEnvelope, SmtpFailure, SmtpReply};
pub use template::TemplateRenderer;
pub use validate::{CheckResult, CheckStatus, DnsChecker, PreSendValidator, Verdict};
