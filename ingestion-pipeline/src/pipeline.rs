use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::blob::BlobStorage;
use common::error::DataApiError;
use futures::StreamExt;
use reqwest::{header, redirect, StatusCode};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::job::{IngestionJob, IngestionPolicy, IngestionReceipt};
use crate::state::JobTransition;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 100;

/// Pulls content over HTTP, stages it on local disk and lands it in blob
/// storage. Attempts are strictly sequential per job; transient failures are
/// retried under the policy's attempt and deadline bounds.
pub struct ContentIngestionPipeline {
    client: reqwest::Client,
    blob: BlobStorage,
    policy: IngestionPolicy,
    staging_dir: PathBuf,
}

impl ContentIngestionPipeline {
    pub fn new(blob: BlobStorage) -> Result<Self, PipelineError> {
        Self::with_policy(blob, IngestionPolicy::default())
    }

    pub fn with_policy(blob: BlobStorage, policy: IngestionPolicy) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(DataApiError::from)?;

        Ok(Self {
            client,
            blob,
            policy,
            staging_dir: std::env::temp_dir(),
        })
    }

    /// Stage downloads under a specific directory instead of the system
    /// temp dir.
    pub fn stage_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Drives one job to a terminal state. Returns the receipt on success;
    /// otherwise reports which bound fired and the cause of the last attempt.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, source = %job.source_url))]
    pub async fn run(&self, mut job: IngestionJob) -> Result<IngestionReceipt, PipelineError> {
        let started = Instant::now();
        loop {
            if job.attempts > 0 {
                tokio::time::sleep(self.policy.retry_delay(job.attempts)).await;
            }
            job.transition(JobTransition::Fetch)?;

            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.attempt(&mut job)).await;
            let cause = match outcome {
                Ok(Ok(bytes)) => {
                    job.transition(JobTransition::Complete)?;
                    let attempts = job.attempts + 1;
                    info!(attempts, bytes, destination = %job.destination, "ingestion succeeded");
                    return Ok(IngestionReceipt {
                        destination: job.destination,
                        bytes,
                        attempts,
                    });
                }
                Ok(Err(PipelineError::Transient(cause))) => cause,
                Ok(Err(other)) => return Err(other),
                Err(_) => format!(
                    "attempt exceeded the {:?} watchdog",
                    self.policy.attempt_timeout
                ),
            };

            job.attempts += 1;
            warn!(attempt = job.attempts, %cause, "ingestion attempt failed");

            if job.attempts >= self.policy.max_attempts {
                job.transition(JobTransition::Abort)?;
                return Err(PipelineError::Exhausted {
                    attempts: job.attempts,
                    last_cause: cause,
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= self.policy.max_elapsed {
                job.transition(JobTransition::Abort)?;
                return Err(PipelineError::DeadlineExceeded {
                    elapsed,
                    last_cause: cause,
                });
            }
            job.transition(JobTransition::ScheduleRetry)?;
        }
    }

    /// One fetch-stage-upload pass. The temp file is removed when this
    /// returns or is cancelled, success and failure alike.
    async fn attempt(&self, job: &mut IngestionJob) -> Result<u64, PipelineError> {
        let response = self
            .client
            .get(job.source_url.clone())
            .header(header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| PipelineError::Transient(format!("request failed: {e}")))?;
        if response.status() != StatusCode::OK {
            return Err(PipelineError::Transient(format!(
                "source returned {}",
                response.status()
            )));
        }

        job.transition(JobTransition::Stage)?;
        let staged = NamedTempFile::new_in(&self.staging_dir)
            .map_err(|e| PipelineError::Transient(format!("staging file: {e}")))?;
        let mut sink = tokio::fs::File::create(staged.path())
            .await
            .map_err(|e| PipelineError::Transient(format!("staging file: {e}")))?;
        let mut stream = response.bytes_stream();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| PipelineError::Transient(format!("body stream: {e}")))?;
            sink.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::Transient(format!("staging write: {e}")))?;
            bytes += chunk.len() as u64;
        }
        sink.flush()
            .await
            .map_err(|e| PipelineError::Transient(format!("staging write: {e}")))?;
        drop(sink);
        debug!(bytes, path = %staged.path().display(), "source staged");

        job.transition(JobTransition::Upload)?;
        let path = staged.path().to_path_buf();
        let data = tokio::task::spawn_blocking(move || std::fs::read(path))
            .await
            .map_err(|e| PipelineError::Transient(format!("staging read: {e}")))?
            .map_err(|e| PipelineError::Transient(format!("staging read: {e}")))?;
        self.blob
            .put(&job.destination, Bytes::from(data))
            .await
            .map_err(|e| PipelineError::Transient(format!("blob upload: {e}")))?;

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_policy() -> IngestionPolicy {
        IngestionPolicy {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
            retry_step: Duration::from_millis(1),
        }
    }

    /// Serves `body` after the first `failures` requests answered 503.
    fn flaky_router(failures: usize, body: &'static [u8]) -> Router {
        let hits = Arc::new(AtomicUsize::new(0));
        Router::new().route(
            "/object",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < failures {
                        (StatusCode::SERVICE_UNAVAILABLE, Vec::new())
                    } else {
                        (StatusCode::OK, body.to_vec())
                    }
                }
            }),
        )
    }

    /// Sends headers and one body chunk, then stalls forever, so the
    /// watchdog fires while the attempt is mid-staging.
    fn stalling_router() -> Router {
        Router::new().route(
            "/object",
            get(|| async {
                let stream = futures::stream::unfold(0u32, |sent| async move {
                    if sent == 0 {
                        Some((Ok::<_, std::io::Error>(Bytes::from_static(b"partial")), 1))
                    } else {
                        futures::future::pending().await
                    }
                });
                axum::body::Body::from_stream(stream)
            }),
        )
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        addr
    }

    fn job_for(addr: SocketAddr) -> IngestionJob {
        IngestionJob::new(
            &format!("http://{addr}/object"),
            "ingested/track-1/cover.bin",
        )
        .expect("job")
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let body: &[u8] = b"streamed blob payload";
        let addr = serve(flaky_router(2, body)).await;
        let staging = tempfile::tempdir().expect("staging dir");

        let blob = BlobStorage::in_memory();
        let pipeline = ContentIngestionPipeline::with_policy(blob.clone(), test_policy())
            .expect("pipeline")
            .stage_in(staging.path());

        let receipt = pipeline.run(job_for(addr)).await.expect("ingestion");
        assert_eq!(receipt.attempts, 3);
        assert_eq!(receipt.bytes, body.len() as u64);

        let landed = blob.get(&receipt.destination).await.expect("blob");
        assert_eq!(landed.as_ref(), body);

        let leftovers = std::fs::read_dir(staging.path()).expect("read dir").count();
        assert_eq!(leftovers, 0, "staged file was not removed");
    }

    #[tokio::test]
    async fn gives_up_when_the_attempt_bound_fires() {
        let addr = serve(flaky_router(usize::MAX, b"")).await;

        let policy = IngestionPolicy {
            max_attempts: 3,
            ..test_policy()
        };
        let pipeline =
            ContentIngestionPipeline::with_policy(BlobStorage::in_memory(), policy)
                .expect("pipeline");

        let result = pipeline.run(job_for(addr)).await;
        let Err(PipelineError::Exhausted {
            attempts,
            last_cause,
        }) = result
        else {
            panic!("expected attempt exhaustion");
        };
        assert_eq!(attempts, 3);
        assert!(last_cause.contains("503"), "cause was {last_cause}");
    }

    #[tokio::test]
    async fn reports_the_deadline_when_it_fires_first() {
        let addr = serve(flaky_router(usize::MAX, b"")).await;

        let policy = IngestionPolicy {
            max_attempts: 1000,
            max_elapsed: Duration::ZERO,
            ..test_policy()
        };
        let pipeline =
            ContentIngestionPipeline::with_policy(BlobStorage::in_memory(), policy)
                .expect("pipeline");

        let result = pipeline.run(job_for(addr)).await;
        assert!(matches!(
            result,
            Err(PipelineError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn watchdog_cancels_a_hung_attempt_and_cleans_up_staging() {
        let addr = serve(stalling_router()).await;
        let staging = tempfile::tempdir().expect("staging dir");

        let policy = IngestionPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(50),
            ..test_policy()
        };
        let pipeline = ContentIngestionPipeline::with_policy(BlobStorage::in_memory(), policy)
            .expect("pipeline")
            .stage_in(staging.path());

        let result = pipeline.run(job_for(addr)).await;
        let Err(PipelineError::Exhausted { last_cause, .. }) = result else {
            panic!("expected attempt exhaustion");
        };
        assert!(last_cause.contains("watchdog"), "cause was {last_cause}");

        let leftovers = std::fs::read_dir(staging.path()).expect("read dir").count();
        assert_eq!(leftovers, 0, "staged file was not removed");
    }

    #[tokio::test]
    async fn retries_overwrite_the_same_destination() {
        let body: &[u8] = b"authoritative bytes";
        let addr = serve(flaky_router(1, body)).await;

        let blob = BlobStorage::in_memory();
        blob.put("ingested/track-1/cover.bin", Bytes::from_static(b"stale partial"))
            .await
            .expect("seed");

        let pipeline =
            ContentIngestionPipeline::with_policy(blob.clone(), test_policy()).expect("pipeline");
        let receipt = pipeline.run(job_for(addr)).await.expect("ingestion");

        let landed = blob.get(&receipt.destination).await.expect("blob");
        assert_eq!(landed.as_ref(), body);
    }
}
