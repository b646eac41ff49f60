use std::time::Duration;

use common::error::DataApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Source URL failed validation before any attempt was made.
    #[error("Source rejected: {0}")]
    Rejected(String),

    #[error("Invalid job transition: {from} -> {event}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    /// One attempt failed in a way the next attempt may recover from.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The attempt bound fired; carries the cause of the final attempt.
    #[error("Gave up after {attempts} attempts: {last_cause}")]
    Exhausted { attempts: u32, last_cause: String },

    /// The elapsed-time bound fired before the attempt bound.
    #[error("Deadline exceeded after {elapsed:?}: {last_cause}")]
    DeadlineExceeded {
        elapsed: Duration,
        last_cause: String,
    },

    #[error(transparent)]
    Internal(#[from] DataApiError),
}
