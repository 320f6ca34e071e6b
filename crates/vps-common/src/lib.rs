// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;

pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum VpsError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Instance suspended: {0}")]
    Suspended(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

// Define the primary Result type for VPS operations
pub type Result<T> = std::result::Result<T, VpsError>;

/// Coarse classification shown to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The caller asked for something invalid. Retrying the same request will not help.
    BadRequest,
    /// Something on our side failed. The caller may retry later.
    TryLater,
}

/// Structured failure handed to the command front-end. Never carries raw runtime text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl VpsError {
    pub fn kind(&self) -> FailureKind {
        match self {
            VpsError::InvalidConfig(_)
            | VpsError::NotFound(_)
            | VpsError::QuotaExceeded(_)
            | VpsError::Suspended(_)
            | VpsError::InsufficientFunds(_) => FailureKind::BadRequest,
            VpsError::Runtime(_) | VpsError::Ledger(_) | VpsError::Persistence(_) => {
                FailureKind::TryLater
            }
        }
    }

    /// Short message safe to show to the requesting user.
    ///
    /// Caller errors are surfaced verbatim since their text is produced by validation
    /// code. Internal failures collapse to a fixed sentence; their detail only goes to logs.
    pub fn user_message(&self) -> String {
        match self {
            VpsError::InvalidConfig(msg) => format!("Invalid configuration: {msg}"),
            VpsError::NotFound(id) => format!("No instance with id {id}"),
            VpsError::QuotaExceeded(msg) => format!("Quota exceeded: {msg}"),
            VpsError::Suspended(id) => {
                format!("Instance {id} is suspended for non-payment. Contact support to reactivate it.")
            }
            VpsError::InsufficientFunds(msg) => format!("Insufficient funds: {msg}"),
            VpsError::Runtime(_) => {
                "The container host could not complete the operation. Please try again later."
                    .to_string()
            }
            VpsError::Ledger(_) => {
                "The billing system is unavailable. Please try again later.".to_string()
            }
            VpsError::Persistence(_) => {
                "The change could not be saved. Please try again later.".to_string()
            }
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.user_message(),
        }
    }
}

impl From<VpsError> for Failure {
    fn from(err: VpsError) -> Self {
        err.to_failure()
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FailureKind::BadRequest => write!(f, "Request rejected: {}", self.message),
            FailureKind::TryLater => write!(f, "Temporary failure: {}", self.message),
        }
    }
}
