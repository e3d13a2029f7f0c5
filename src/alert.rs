use async_trait::async_trait;
use tracing::error;

use crate::error::AlertError;

/// Operator-facing report channel for failures that are not retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertClient: Send + Sync {
    async fn send_message(&self, message_body: String) -> Result<(), AlertError>;
}

/// Emits alerts as `error` events for whatever collects the process logs.
#[derive(Debug, Default)]
pub struct TracingAlertClient;

#[async_trait]
impl AlertClient for TracingAlertClient {
    async fn send_message(&self, message_body: String) -> Result<(), AlertError> {
        error!(target: "interview_ingest::alert", alert = %message_body);
        Ok(())
    }
}
