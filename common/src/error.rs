use std::fmt;

use thiserror::Error;
use tokio::task::JoinError;

use crate::cache::CacheError;
use crate::store::StoreError;

/// A single structured field-level violation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All field-level violations of a single request, reported together so a
/// caller can display every problem at once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

// Core internal errors
#[derive(Error, Debug)]
pub enum DataApiError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),
    #[error("Validation error: {0}")]
    Validation(FieldErrors),
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl From<serde_json::Error> for DataApiError {
    fn from(err: serde_json::Error) -> Self {
        DataApiError::Serialization(err.to_string())
    }
}

impl DataApiError {
    pub fn validation_of(field: impl Into<String>, message: impl Into<String>) -> Self {
        DataApiError::Validation(FieldErrors(vec![FieldError::new(field, message)]))
    }
}
