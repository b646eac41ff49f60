use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::state::{compute_next_state, JobState, JobTransition};

pub const MAX_ATTEMPTS: u32 = 30;
pub const MAX_ELAPSED: Duration = Duration::from_secs(15 * 60);
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const RETRY_STEP: Duration = Duration::from_millis(1000);

/// Retry and deadline policy of the pipeline. The defaults are the
/// production bounds; tests shrink them.
#[derive(Debug, Clone)]
pub struct IngestionPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub attempt_timeout: Duration,
    pub retry_step: Duration,
}

impl Default for IngestionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            max_elapsed: MAX_ELAPSED,
            attempt_timeout: ATTEMPT_TIMEOUT,
            retry_step: RETRY_STEP,
        }
    }
}

impl IngestionPolicy {
    /// Linear backoff: attempt n waits n times the step, attempt 0 runs
    /// immediately.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_step * attempt
    }
}

/// One unit of ingestion work: pull the source URL and land its bytes at the
/// blob destination. Every attempt reuses the same destination key, so a
/// retried upload overwrites any partial prior one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: String,
    pub source_url: Url,
    pub destination: String,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl IngestionJob {
    pub fn new(source_url: &str, destination: impl Into<String>) -> Result<Self, PipelineError> {
        let source_url = Url::parse(source_url)
            .map_err(|e| PipelineError::Rejected(format!("unparseable source url: {e}")))?;
        ensure_source_url_allowed(&source_url)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source_url,
            destination: destination.into(),
            state: JobState::default(),
            attempts: 0,
            created_at: Utc::now(),
        })
    }

    pub fn transition(&mut self, event: JobTransition) -> Result<(), PipelineError> {
        self.state = compute_next_state(&self.state, event)?;
        Ok(())
    }
}

fn ensure_source_url_allowed(url: &Url) -> Result<(), PipelineError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PipelineError::Rejected(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(PipelineError::Rejected("source url has no host".to_string()));
    }
    Ok(())
}

/// Delivered to the caller on success; the blob reference is theirs to
/// persist from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionReceipt {
    pub destination: String,
    pub bytes: u64,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults() {
        let job = IngestionJob::new("https://example.com/cover.bin", "ingested/cover.bin")
            .expect("job");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.destination, "ingested/cover.bin");
    }

    #[test]
    fn non_http_sources_are_rejected() {
        for url in [
            "ftp://example.com/file",
            "file:///etc/passwd",
            "data:text/plain,hello",
            "not a url at all",
        ] {
            let result = IngestionJob::new(url, "dest");
            assert!(
                matches!(result, Err(PipelineError::Rejected(_))),
                "{url} was not rejected"
            );
        }
    }

    #[test]
    fn retry_delays_are_linear_in_the_attempt_number() {
        let policy = IngestionPolicy::default();
        assert_eq!(policy.retry_delay(0), Duration::ZERO);
        for attempt in 1..=5 {
            assert_eq!(
                policy.retry_delay(attempt),
                Duration::from_millis(u64::from(attempt) * 1000)
            );
        }
    }
}
