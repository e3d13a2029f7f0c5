use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::CompletionPolicy;
use crate::alert::{AlertClient, TracingAlertClient};
use crate::db::DbHandle;
use crate::events::{EventPublisher, PgEventPublisher};
use crate::guard::{PgSubmissionGuard, SubmissionGuard};
use crate::interviews::{InterviewStore, PgInterviewStore};
use crate::lock::{LockClient, PgLockClient};
use crate::media::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::queue::{JobQueue, PgJobQueue};
use crate::storage::BlobStore;

/// Tunables shared by the entry point, workers and finalizer.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub job_timeout: Duration,
    /// Queue visibility timeout. Kept longer than `job_timeout`.
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub max_payload_bytes: usize,
    pub completion_policy: CompletionPolicy,
    pub lock_expiry: Duration,
    pub publish_attempts: u32,
    pub publish_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            max_attempts: 5,
            retry_backoff: Duration::from_secs(2),
            max_retry_backoff: Duration::from_secs(300),
            job_timeout: Duration::from_secs(120),
            lease_duration: Duration::from_secs(180),
            poll_interval: Duration::from_secs(1),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            completion_policy: CompletionPolicy::Both,
            lock_expiry: Duration::from_secs(60),
            publish_attempts: 5,
            publish_backoff: Duration::from_millis(500),
        }
    }
}

impl PipelineSettings {
    /// Exponential backoff before redelivering a job on its `attempts`-th failure.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_backoff)
    }
}

/// Handles to every collaborator of the pipeline.
#[derive(Clone)]
pub struct Pipeline {
    pub interviews: Arc<dyn InterviewStore>,
    pub guard: Arc<dyn SubmissionGuard>,
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub locks: Arc<dyn LockClient>,
    pub events: Arc<dyn EventPublisher>,
    pub alerts: Arc<dyn AlertClient>,
    pub settings: Arc<PipelineSettings>,
}

impl Pipeline {
    /// Pipeline whose shared state lives in Postgres.
    pub fn postgres(db: &DbHandle, blobs: Arc<dyn BlobStore>, settings: PipelineSettings) -> Self {
        let pool = db.pool();
        Pipeline {
            interviews: Arc::new(PgInterviewStore::new(pool.clone())),
            guard: Arc::new(PgSubmissionGuard::new(pool.clone())),
            queue: Arc::new(PgJobQueue::new(pool.clone())),
            blobs,
            locks: Arc::new(PgLockClient::new(pool.clone())),
            events: Arc::new(PgEventPublisher::new(pool)),
            alerts: Arc::new(TracingAlertClient),
            settings: Arc::new(settings),
        }
    }

    /// Best-effort operator report; a failing alert channel is only logged.
    pub async fn alert(&self, message: String) {
        if let Err(err) = self.alerts.send_message(message).await {
            tracing::warn!(message = "Failed to send alert", error = ?err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = PipelineSettings {
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(settings.backoff_for(1), Duration::from_secs(1));
        assert_eq!(settings.backoff_for(2), Duration::from_secs(2));
        assert_eq!(settings.backoff_for(4), Duration::from_secs(8));
        assert_eq!(settings.backoff_for(5), Duration::from_secs(10));
        assert_eq!(settings.backoff_for(40), Duration::from_secs(10));
    }
}
