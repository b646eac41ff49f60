//! Resilient HTTP-to-blob content ingestion.
//!
//! [`pipeline::ContentIngestionPipeline`] drives an [`job::IngestionJob`]
//! through fetch, disk staging and blob upload, retrying transient failures
//! with linear backoff under attempt and deadline bounds.

pub mod error;
pub mod job;
pub mod pipeline;
pub mod state;

pub use error::PipelineError;
pub use job::{IngestionJob, IngestionPolicy, IngestionReceipt};
pub use pipeline::ContentIngestionPipeline;
pub use state::JobState;
