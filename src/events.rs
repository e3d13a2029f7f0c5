use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::EventError;

/// Postgres notification channel carrying completion events.
pub const COMPLETION_CHANNEL: &str = "interview_completed";

/// Published once per finalized interview. The event is stored with the
/// completed status and stays pending until a publish succeeds. Delivery is
/// at-least-once, so consumers key on `interview_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub interview_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), EventError>;
}

/// Notifies listeners on [`COMPLETION_CHANNEL`]. The outbox row itself is
/// written by the interview store when the interview completes.
pub struct PgEventPublisher {
    pool: Arc<PgPool>,
}

impl PgEventPublisher {
    pub fn new(pool: Arc<PgPool>) -> Self {
        PgEventPublisher { pool }
    }
}

#[async_trait]
impl EventPublisher for PgEventPublisher {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(event)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(COMPLETION_CHANNEL)
            .bind(&payload)
            .execute(&*self.pool)
            .await?;

        debug!(message = "Published completion event", interview_id = %event.interview_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_carries_interview_identity() {
        let event = CompletionEvent {
            interview_id: Uuid::nil(),
            completed_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["interview_id"], Uuid::nil().to_string());
        let back: CompletionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
