use std::future::Future;
use std::time::Duration;

use common::utils::config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::PipelineError;

/// Result contract returned to the calling consumer. Never persisted; the
/// caller decides the next side effect (ack, settle the document, nothing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Success,
    WillRetry,
    Failed,
    MaxRetriesExceeded,
}

/// Bounded retry with exponential backoff and re-enqueue. Each `execute`
/// call makes at most one processing attempt: a failed attempt becomes a
/// new delayed message via `republish` instead of blocking the consumer's
/// single in-flight slot for the whole backoff ladder.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retry_count: u32,
    pub base_delay_secs: u64,
    pub exponential_backoff: bool,
}

impl RetryPolicy {
    pub fn new(max_retry_count: u32, base_delay_secs: u64, exponential_backoff: bool) -> Self {
        Self {
            max_retry_count,
            base_delay_secs,
            exponential_backoff,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.max_retry_count,
            config.retry_base_delay_secs,
            config.exponential_backoff,
        )
    }

    /// Backoff before retry attempt `attempt` (1-indexed):
    /// `base_delay_secs ^ attempt` seconds in exponential mode, constant
    /// `base_delay_secs` otherwise.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = if self.exponential_backoff {
            self.base_delay_secs.saturating_pow(attempt)
        } else {
            self.base_delay_secs
        };
        Duration::from_secs(secs)
    }

    pub async fn execute<P, PF, R, RF>(
        &self,
        document_id: &str,
        current_retry_count: u32,
        shutdown: &CancellationToken,
        process: P,
        republish: R,
    ) -> RetryOutcome
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<(), PipelineError>>,
        R: FnOnce() -> RF,
        RF: Future<Output = anyhow::Result<()>>,
    {
        if current_retry_count >= self.max_retry_count {
            warn!(
                document_id,
                retry_count = current_retry_count,
                "retry budget exhausted before attempt"
            );
            return RetryOutcome::MaxRetriesExceeded;
        }

        let err = match process().await {
            Ok(()) => return RetryOutcome::Success,
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(document_id, error = %err, "permanent failure; not retrying");
            return RetryOutcome::Failed;
        }

        let attempt = current_retry_count.saturating_add(1);
        if attempt >= self.max_retry_count {
            warn!(document_id, attempt, "retry budget exhausted");
            return RetryOutcome::Failed;
        }

        let delay = self.delay_for(attempt);
        info!(
            document_id,
            attempt,
            delay_secs = delay.as_secs(),
            error = %err,
            "attempt failed; backing off before republish"
        );

        tokio::select! {
            () = shutdown.cancelled() => {
                // Dropping the retry on shutdown beats racing a republish
                // against a closing connection.
                warn!(document_id, "shutdown during backoff; dropping pending republish");
                return RetryOutcome::WillRetry;
            }
            () = tokio::time::sleep(delay) => {}
        }

        match republish().await {
            Ok(()) => RetryOutcome::WillRetry,
            Err(republish_err) => {
                // No future delivery is coming; the caller must settle the
                // document instead of leaving it waiting for a retry.
                error!(
                    document_id,
                    error = %republish_err,
                    "republish failed; reporting the attempt as failed"
                );
                RetryOutcome::Failed
            }
        }
    }
}
