use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GuardError;
use crate::{InterviewStatus, Modality};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveResult {
    Accepted,
    AlreadyExists,
    /// The interview left `scheduled`; nothing was reserved.
    Closed(InterviewStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordResult {
    Recorded,
    /// The same url was already recorded for the slot.
    Unchanged,
}

/// Shared store enforcing at-most-once acceptance and recording per
/// (interview, modality, question) slot.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmissionGuard: Send + Sync {
    /// Atomically reserve a slot of a `scheduled` interview. Exactly one
    /// concurrent caller sees `Accepted`. Fails with
    /// [`GuardError::UnknownInterview`] when the interview does not exist.
    async fn try_reserve(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    ) -> Result<ReserveResult, GuardError>;

    /// Store the final url of a reserved slot. Recording a different url over
    /// an existing one fails with [`GuardError::Conflict`], recording into a
    /// slot that holds no reservation with [`GuardError::NotReserved`].
    async fn record(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
        url: &str,
    ) -> Result<RecordResult, GuardError>;

    async fn recorded_url(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    ) -> Result<Option<String>, GuardError>;

    /// Recorded urls by question index. Reserved but unrecorded slots are not included.
    async fn read_all(&self, interview_id: Uuid, modality: Modality) -> Result<BTreeMap<u32, String>, GuardError>;

    /// Drop a reservation that never got a url. Returns whether one was dropped.
    async fn release(&self, interview_id: Uuid, modality: Modality, question_index: u32) -> Result<bool, GuardError>;

    async fn clear(&self, interview_id: Uuid, modality: Modality) -> Result<u64, GuardError>;
}

pub struct PgSubmissionGuard {
    pool: Arc<PgPool>,
}

impl PgSubmissionGuard {
    pub fn new(pool: Arc<PgPool>) -> Self {
        PgSubmissionGuard { pool }
    }
}

#[async_trait]
impl SubmissionGuard for PgSubmissionGuard {
    async fn try_reserve(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    ) -> Result<ReserveResult, GuardError> {
        // The share lock orders this insert against the finalizer's status
        // update: after a concurrent completion the re-checked row is no
        // longer scheduled and nothing is inserted.
        let row: Option<(Option<InterviewStatus>, bool)> = sqlx::query_as(
            "WITH interview AS ( \
                SELECT status FROM interviews WHERE id = $1 FOR SHARE \
            ), reserved AS ( \
                INSERT INTO media_submissions (interview_id, modality, question_index) \
                SELECT $1, $2, $3 FROM interview WHERE interview.status = 'scheduled' \
                ON CONFLICT (interview_id, modality, question_index) DO NOTHING \
                RETURNING 1 \
            ) \
            SELECT (SELECT status FROM interview), EXISTS (SELECT 1 FROM reserved)",
        )
        .bind(interview_id)
        .bind(modality)
        .bind(question_index as i32)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            None | Some((None, _)) => Err(GuardError::UnknownInterview(interview_id)),
            Some((Some(_), true)) => Ok(ReserveResult::Accepted),
            Some((Some(InterviewStatus::Scheduled), false)) => Ok(ReserveResult::AlreadyExists),
            Some((Some(status), false)) => Ok(ReserveResult::Closed(status)),
        }
    }

    async fn record(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
        url: &str,
    ) -> Result<RecordResult, GuardError> {
        let recorded: Option<String> = sqlx::query_scalar(
            "UPDATE media_submissions SET url = $4, recorded_at = now() \
            WHERE interview_id = $1 AND modality = $2 AND question_index = $3 AND url IS NULL \
            RETURNING url",
        )
        .bind(interview_id)
        .bind(modality)
        .bind(question_index as i32)
        .bind(url)
        .fetch_optional(&*self.pool)
        .await?;

        if recorded.is_some() {
            debug!(message = "Recorded submission", %interview_id, %modality, question_index, url);
            return Ok(RecordResult::Recorded);
        }

        let Some(existing) = self.recorded_url(interview_id, modality, question_index).await? else {
            warn!(message = "No reservation to record into", %interview_id, %modality, question_index);
            return Err(GuardError::NotReserved {
                interview_id,
                modality,
                question_index,
            });
        };
        if existing == url {
            Ok(RecordResult::Unchanged)
        } else {
            warn!(message = "Conflicting submission url", %interview_id, %modality, question_index, existing = %existing, attempted = url);
            Err(GuardError::Conflict {
                interview_id,
                modality,
                question_index,
                existing,
                attempted: url.to_string(),
            })
        }
    }

    async fn recorded_url(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    ) -> Result<Option<String>, GuardError> {
        let url: Option<Option<String>> = sqlx::query_scalar(
            "SELECT url FROM media_submissions \
            WHERE interview_id = $1 AND modality = $2 AND question_index = $3",
        )
        .bind(interview_id)
        .bind(modality)
        .bind(question_index as i32)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(url.flatten())
    }

    async fn read_all(&self, interview_id: Uuid, modality: Modality) -> Result<BTreeMap<u32, String>, GuardError> {
        let rows: Vec<(i32, String)> = sqlx::query_as(
            "SELECT question_index, url FROM media_submissions \
            WHERE interview_id = $1 AND modality = $2 AND url IS NOT NULL",
        )
        .bind(interview_id)
        .bind(modality)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(|(index, url)| (index as u32, url)).collect())
    }

    async fn release(&self, interview_id: Uuid, modality: Modality, question_index: u32) -> Result<bool, GuardError> {
        let result = sqlx::query(
            "DELETE FROM media_submissions \
            WHERE interview_id = $1 AND modality = $2 AND question_index = $3 AND url IS NULL",
        )
        .bind(interview_id)
        .bind(modality)
        .bind(question_index as i32)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear(&self, interview_id: Uuid, modality: Modality) -> Result<u64, GuardError> {
        let result = sqlx::query("DELETE FROM media_submissions WHERE interview_id = $1 AND modality = $2")
            .bind(interview_id)
            .bind(modality)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
