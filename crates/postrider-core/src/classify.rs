//! SMTP failure classification
//!
//! Maps a raw protocol failure onto a retry-relevant taxonomy. Rules are
//! checked in priority order; anything unrecognized defaults to a retryable
//! transient failure, since retrying a permanent failure wastes a few
//! attempts while abandoning a recoverable one loses the message.

use crate::smtp::{FailureKind, SmtpFailure};
use std::time::Duration;

/// Reply codes that never deserve a retry.
const PERMANENT_CODES: &[u16] = &[501, 502, 503, 504, 521, 550, 551, 553, 554];

/// Reply codes for transient server-side conditions.
const TRANSIENT_CODES: &[u16] = &[421, 450, 451, 452, 455];

/// Authentication failure codes.
const AUTH_CODES: &[u16] = &[530, 534, 535];

const AUTH_PHRASES: &[&str] = &[
    "authentication",
    "auth required",
    "username and password not accepted",
    "login",
    "credentials",
];

const MAILBOX_PHRASES: &[&str] = &[
    "user unknown",
    "no such user",
    "does not exist",
    "recipient rejected",
    "recipient address rejected",
    "invalid mailbox",
    "mailbox unavailable",
    "address rejected",
    "not found",
];

const THROTTLE_PHRASES: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many",
    "quota",
    "throttl",
    "sending limit",
];

/// Failure class, in the order the delivery engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The server definitively rejected the transaction.
    Permanent,
    /// A temporary condition; retry with normal backoff.
    Transient,
    /// The server is throttling; retry with a longer delay.
    RateLimited,
    /// The session broke below the protocol (connect, timeout, reset, TLS).
    ConnectionFailure,
    /// Credentials were rejected.
    AuthFailure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Permanent => "permanent",
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ConnectionFailure => "connection_failure",
            ErrorClass::AuthFailure => "auth_failure",
        }
    }

    /// Whether this class invalidates the connection it happened on.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::ConnectionFailure | ErrorClass::AuthFailure
        )
    }
}

/// A classified failure: the class, the retry decision, and a lower bound on
/// the wait before the next attempt (rate limiting wants more than plain
/// backoff would give on early attempts).
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub class: ErrorClass,
    pub retry: bool,
    pub delay_floor: Option<Duration>,
}

fn contains_any(haystack: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| haystack.contains(p))
}

/// Classify a protocol failure.
pub fn classify(failure: &SmtpFailure) -> Classification {
    let text = failure.message.to_lowercase();

    // Session-level breakage carries no reply code worth inspecting.
    if failure.code.is_none()
        && matches!(
            failure.kind,
            FailureKind::Connect | FailureKind::Timeout | FailureKind::Tls | FailureKind::Io
        )
    {
        if contains_any(&text, AUTH_PHRASES) {
            return Classification {
                class: ErrorClass::AuthFailure,
                retry: false,
                delay_floor: None,
            };
        }
        return Classification {
            class: ErrorClass::ConnectionFailure,
            retry: true,
            delay_floor: None,
        };
    }

    if let Some(code) = failure.code {
        if AUTH_CODES.contains(&code) || (code >= 500 && contains_any(&text, AUTH_PHRASES)) {
            return Classification {
                class: ErrorClass::AuthFailure,
                retry: false,
                delay_floor: None,
            };
        }

        if code >= 500 && contains_any(&text, MAILBOX_PHRASES) {
            return Classification {
                class: ErrorClass::Permanent,
                retry: false,
                delay_floor: None,
            };
        }

        if contains_any(&text, THROTTLE_PHRASES) {
            return Classification {
                class: ErrorClass::RateLimited,
                retry: true,
                delay_floor: Some(Duration::from_secs(60)),
            };
        }

        if PERMANENT_CODES.contains(&code) {
            return Classification {
                class: ErrorClass::Permanent,
                retry: false,
                delay_floor: None,
            };
        }

        if TRANSIENT_CODES.contains(&code) || (400..500).contains(&code) {
            return Classification {
                class: ErrorClass::Transient,
                retry: true,
                delay_floor: None,
            };
        }
    }

    // No code, or a code outside every table: fall back to the text.
    if contains_any(&text, AUTH_PHRASES) {
        return Classification {
            class: ErrorClass::AuthFailure,
            retry: false,
            delay_floor: None,
        };
    }
    if contains_any(&text, THROTTLE_PHRASES) {
        return Classification {
            class: ErrorClass::RateLimited,
            retry: true,
            delay_floor: Some(Duration::from_secs(60)),
        };
    }
    if contains_any(&text, &["connection", "timeout", "timed out", "reset", "broken pipe"]) {
        return Classification {
            class: ErrorClass::ConnectionFailure,
            retry: true,
            delay_floor: None,
        };
    }
    if contains_any(&text, MAILBOX_PHRASES) {
        return Classification {
            class: ErrorClass::Permanent,
            retry: false,
            delay_floor: None,
        };
    }

    Classification {
        class: ErrorClass::Transient,
        retry: true,
        delay_floor: None,
    }
}
