//! Error types for flowline.
//!
//! Syntax and semantic problems in flow source are reported as
//! [`Diagnostic`](crate::dsl::Diagnostic) data, not through this type. `Error`
//! covers everything that actually stops an operation: rejected definitions,
//! node failures surfaced to callers, and infrastructure faults.

use thiserror::Error;

use crate::events::SubscriptionError;

/// Result type alias for flowline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowline error types.
///
/// Each variant maps to a stable code for machine consumers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Event stream error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic parsing.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Compile(_) => "COMPILE_ERROR",
            Error::Node(_) => "NODE_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Subscription(_) => "STREAM_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Toml(_) => "TOML_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// True for failures of the machinery around a run (store, disk, event
    /// stream) as opposed to failures of the flow or its nodes.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::Database(_)
                | Error::Io(_)
                | Error::Subscription(_)
                | Error::Internal(_)
        )
    }

    /// Convert to a structured JSON error object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "infrastructure": self.is_infrastructure(),
            }
        })
    }
}
