//! Error types for the audit shipper

use thiserror::Error;

use crate::logger::LoggerState;

/// Errors surfaced to code that configures or produces into the audit logger
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Invalid audit log configuration: {0}")]
    Config(String),

    #[error("Failed to serialize audit record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit log queue is closed")]
    QueueClosed,

    #[error("Audit logger cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: LoggerState,
    },
}

/// Errors from a single object-store write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Invalid request configuration: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
