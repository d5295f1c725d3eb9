//! Bounce interpretation
//!
//! Reads the same failure the classifier sees and decides whether it is a
//! synchronous bounce, and of which kind. Only in-transaction rejections are
//! interpreted here; asynchronous bounce reports arriving as mail are out of
//! scope. A hard bounce ends delivery for the recipient no matter how much
//! retry budget remains.

use crate::smtp::SmtpFailure;

/// Codes that reject the mailbox or domain outright.
const HARD_BOUNCE_CODES: &[u16] = &[550, 551, 553, 554];

/// Codes for temporary mailbox conditions. 552 (storage exceeded) is a full
/// mailbox, which can drain, so it sits here rather than with the hard set.
const SOFT_BOUNCE_CODES: &[u16] = &[421, 450, 451, 452, 552];

const HARD_PHRASES: &[&str] = &[
    "user unknown",
    "no such user",
    "does not exist",
    "unknown recipient",
    "invalid mailbox",
    "address rejected",
    "recipient rejected",
    "unrouteable",
    "domain not found",
];

const SOFT_PHRASES: &[&str] = &[
    "mailbox full",
    "over quota",
    "quota exceeded",
    "insufficient storage",
    "temporarily unavailable",
    "temporarily deferred",
    "greylist",
    "try again later",
];

/// Kind of synchronous bounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceKind {
    /// The mailbox or domain is gone or permanently rejecting.
    Hard,
    /// A temporary mailbox condition (full, deferred, greylisted).
    Soft,
    /// The failure is not a bounce (auth, connection, syntax, ...).
    NotABounce,
}

impl BounceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BounceKind::Hard => "hard",
            BounceKind::Soft => "soft",
            BounceKind::NotABounce => "none",
        }
    }
}

/// A bounce verdict with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounce {
    pub kind: BounceKind,
    pub reason: String,
}

fn hard_reason(code: u16) -> &'static str {
    match code {
        550 => "mailbox does not exist or is rejecting mail",
        551 => "user not local",
        553 => "mailbox name not allowed",
        554 => "transaction failed",
        _ => "permanently rejected",
    }
}

fn soft_reason(code: u16) -> &'static str {
    match code {
        421 => "service temporarily unavailable",
        450 => "mailbox temporarily unavailable",
        451 => "temporary processing error",
        452 => "insufficient storage",
        552 => "mailbox storage exceeded",
        _ => "temporarily rejected",
    }
}

/// Interpret a protocol failure as a bounce verdict.
pub fn interpret(failure: &SmtpFailure) -> Bounce {
    let text = failure.message.to_lowercase();

    if let Some(code) = failure.code {
        // Phrase evidence refines the code tables: a 5xx talking about a
        // full mailbox is a soft condition even though the code is final.
        if SOFT_PHRASES.iter().any(|p| text.contains(p)) {
            return Bounce {
                kind: BounceKind::Soft,
                reason: soft_reason(code).to_string(),
            };
        }

        if HARD_BOUNCE_CODES.contains(&code) {
            return Bounce {
                kind: BounceKind::Hard,
                reason: hard_reason(code).to_string(),
            };
        }

        if SOFT_BOUNCE_CODES.contains(&code) {
            return Bounce {
                kind: BounceKind::Soft,
                reason: soft_reason(code).to_string(),
            };
        }

        if code >= 500 && HARD_PHRASES.iter().any(|p| text.contains(p)) {
            return Bounce {
                kind: BounceKind::Hard,
                reason: "mailbox or domain permanently rejecting".to_string(),
            };
        }
    }

    Bounce {
        kind: BounceKind::NotABounce,
        reason: String::new(),
    }
}
