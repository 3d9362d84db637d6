use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Stable error discriminator carried in every error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or missing manifest fields, undecodable payloads
    ValidationError,
    /// Target name is taken and no override was given
    AlreadyExists,
    /// Attempt to create, overwrite, rename or delete a built-in script
    BuiltinProtected,
    /// rm!/mv!/toggle on an absent name
    NotFound,
    /// Aggregate rejection of an all-or-nothing batch
    BatchRejected,
    /// Storage backend kept failing after retries
    PersistenceError,
    /// Live transport handshake or send failed
    TransportError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::BuiltinProtected => "BUILTIN_PROTECTED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BatchRejected => "BATCH_REJECTED",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
        }
    }
}

/// Structured error reply sent back over the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// Builder for creating error responses
pub struct ErrorResponseBuilder {
    code: ErrorCode,
    message: String,
    details: Option<String>,
    context: HashMap<String, serde_json::Value>,
}

impl ErrorResponseBuilder {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            context: HashMap::new(),
        }
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ErrorResponse {
        ErrorResponse {
            success: false,
            error: self.message,
            code: self.code,
            details: self.details,
            context: self.context,
        }
    }
}

impl From<CrudError> for ErrorResponse {
    fn from(err: CrudError) -> Self {
        err.to_error_response()
    }
}

/// Errors raised by a persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage snapshot is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Check if a write that failed with this error is worth repeating
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}

/// One entry of an aggregate batch rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub name: String,
    pub code: ErrorCode,
    pub reason: String,
}

/// Errors surfaced by the CRUD surface
#[derive(Debug, Error)]
pub enum CrudError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Script '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Cannot {action} built-in script '{name}'")]
    BuiltinProtected { name: String, action: String },

    #[error("Script '{name}' not found")]
    NotFound { name: String },

    #[error("Batch rejected, nothing was changed: {}", summarize(.failures))]
    BatchRejected { failures: Vec<BatchFailure> },

    #[error("Failed to persist scripts after {attempts} attempt(s): {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

fn summarize(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.name, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CrudError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn builtin(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::BuiltinProtected {
            name: name.into(),
            action: action.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CrudError::Validation { .. } => ErrorCode::ValidationError,
            CrudError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            CrudError::BuiltinProtected { .. } => ErrorCode::BuiltinProtected,
            CrudError::NotFound { .. } => ErrorCode::NotFound,
            CrudError::BatchRejected { .. } => ErrorCode::BatchRejected,
            CrudError::Persistence { .. } => ErrorCode::PersistenceError,
        }
    }

    /// Convert to the reply shape used by the bridge
    pub fn to_error_response(&self) -> ErrorResponse {
        let builder = ErrorResponseBuilder::new(self.code(), self.to_string());
        match self {
            CrudError::BatchRejected { failures } => builder.context(
                "failures",
                serde_json::to_value(failures).unwrap_or(serde_json::Value::Null),
            ),
            CrudError::Persistence { source, .. } => builder.details(source.to_string()),
            _ => builder,
        }
        .build()
    }
}
