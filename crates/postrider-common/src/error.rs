//! Error types for postrider

use thiserror::Error;

/// Main error type for postrider
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Roster error: {0}")]
    Roster(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for postrider
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that must abort the run before any send is attempted.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
