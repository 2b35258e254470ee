//! Error types for the extension system.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced to extension code, either synchronously or through
/// `runtime.lastError` on a callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    #[error("Could not clone value: {0}")]
    Serialization(String),

    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    #[error("A listener indicated an asynchronous response, but the message channel closed before a response was received")]
    ChannelClosed,

    #[error("Missing required permission: {0}")]
    InsufficientPermission(String),

    #[error("{0} quota exceeded")]
    QuotaExceeded(String),

    #[error("Invalid access level: {0}")]
    InvalidAccessLevel(String),

    #[error("Untrusted sender cannot set access level")]
    UntrustedSenderDenied,

    #[error("Access to storage.{0} is not allowed from this context")]
    StorageAreaNotAvailable(String),

    #[error("storage.managed is read-only")]
    ManagedStorageReadOnly,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Execution context is no longer available")]
    ContextGone,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// The `runtime.lastError` object handed to callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
}

impl From<&ExtensionError> for LastError {
    fn from(err: &ExtensionError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// What a callback receives: a value on success, or `last_error` set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl Reply {
    pub fn ok(value: Option<Value>) -> Self {
        Self {
            value,
            last_error: None,
        }
    }

    pub fn err(err: &ExtensionError) -> Self {
        Self {
            value: None,
            last_error: Some(err.into()),
        }
    }

    pub fn from_result(result: ExtensionResult<Option<Value>>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(err) => Self::err(&err),
        }
    }

    pub fn is_err(&self) -> bool {
        self.last_error.is_some()
    }

    /// The error message, if the operation failed.
    pub fn error_message(&self) -> Option<&str> {
        self.last_error.as_ref().map(|e| e.message.as_str())
    }
}
