use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use crate::db::interval_secs;
use crate::error::InterviewStoreError;
use crate::events::CompletionEvent;
use crate::{Interview, InterviewStatus, Question};

/// Persistent interview records. Owned by interview management; the pipeline
/// only reads them and completes them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InterviewStore: Send + Sync {
    /// Insert a new `scheduled` interview with the given question texts.
    async fn create(&self, questions: Vec<String>) -> Result<Interview, InterviewStoreError>;

    async fn get(&self, interview_id: Uuid) -> Result<Option<Interview>, InterviewStoreError>;

    /// Write the merged question media, move the interview to `completed` and
    /// queue `event` as unpublished, but only if it is still `scheduled`.
    /// Returns false when the conditional transition did not apply, in which
    /// case nothing was written.
    async fn complete(
        &self,
        interview_id: Uuid,
        questions: &[Question],
        event: &CompletionEvent,
    ) -> Result<bool, InterviewStoreError>;

    /// The completion event of the interview if it was never marked published.
    async fn pending_event(&self, interview_id: Uuid) -> Result<Option<CompletionEvent>, InterviewStoreError>;

    /// Unpublished completion events at least `older_than` old, oldest first.
    async fn pending_events(&self, older_than: Duration) -> Result<Vec<CompletionEvent>, InterviewStoreError>;

    async fn mark_published(&self, interview_id: Uuid) -> Result<(), InterviewStoreError>;
}

#[derive(sqlx::FromRow)]
struct InterviewRow {
    id: Uuid,
    status: InterviewStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    text: String,
    audio_url: Option<String>,
    video_url: Option<String>,
}

pub struct PgInterviewStore {
    pool: Arc<PgPool>,
}

impl PgInterviewStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        PgInterviewStore { pool }
    }
}

#[async_trait]
impl InterviewStore for PgInterviewStore {
    async fn create(&self, questions: Vec<String>) -> Result<Interview, InterviewStoreError> {
        if questions.is_empty() {
            return Err(InterviewStoreError::NoQuestions);
        }

        let mut tx = self.pool.begin().await?;
        let row: InterviewRow = sqlx::query_as(
            "INSERT INTO interviews (id, status) VALUES ($1, 'scheduled') \
            RETURNING id, status, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .fetch_one(&mut *tx)
        .await?;

        for (position, text) in questions.iter().enumerate() {
            sqlx::query("INSERT INTO interview_questions (interview_id, position, text) VALUES ($1, $2, $3)")
                .bind(row.id)
                .bind(position as i32)
                .bind(text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(message = "Created interview", interview_id = %row.id, questions = questions.len());
        Ok(Interview {
            id: row.id,
            questions: questions.into_iter().map(Question::new).collect(),
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn get(&self, interview_id: Uuid) -> Result<Option<Interview>, InterviewStoreError> {
        let Some(row) = sqlx::query_as::<_, InterviewRow>(
            "SELECT id, status, created_at, updated_at FROM interviews WHERE id = $1",
        )
        .bind(interview_id)
        .fetch_optional(&*self.pool)
        .await?
        else {
            return Ok(None);
        };

        let questions: Vec<QuestionRow> = sqlx::query_as(
            "SELECT text, audio_url, video_url FROM interview_questions \
            WHERE interview_id = $1 ORDER BY position ASC",
        )
        .bind(interview_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(Some(Interview {
            id: row.id,
            questions: questions
                .into_iter()
                .map(|q| Question {
                    text: q.text,
                    audio_url: q.audio_url,
                    video_url: q.video_url,
                })
                .collect(),
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    async fn complete(
        &self,
        interview_id: Uuid,
        questions: &[Question],
        event: &CompletionEvent,
    ) -> Result<bool, InterviewStoreError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE interviews SET status = 'completed', updated_at = now() \
            WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(interview_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (position, question) in questions.iter().enumerate() {
            sqlx::query(
                "UPDATE interview_questions SET audio_url = $3, video_url = $4 \
                WHERE interview_id = $1 AND position = $2",
            )
            .bind(interview_id)
            .bind(position as i32)
            .bind(question.audio_url.as_deref())
            .bind(question.video_url.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO interview_events (interview_id, completed_at, payload) VALUES ($1, $2, $3) \
            ON CONFLICT (interview_id) DO NOTHING",
        )
        .bind(interview_id)
        .bind(event.completed_at)
        .bind(Json(event))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn pending_event(&self, interview_id: Uuid) -> Result<Option<CompletionEvent>, InterviewStoreError> {
        let row: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT interview_id, completed_at FROM interview_events \
            WHERE interview_id = $1 AND published_at IS NULL",
        )
        .bind(interview_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|(interview_id, completed_at)| CompletionEvent {
            interview_id,
            completed_at,
        }))
    }

    async fn pending_events(&self, older_than: Duration) -> Result<Vec<CompletionEvent>, InterviewStoreError> {
        let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT interview_id, completed_at FROM interview_events \
            WHERE published_at IS NULL AND completed_at <= now() - make_interval(secs => $1) \
            ORDER BY completed_at ASC \
            LIMIT 100",
        )
        .bind(interval_secs(older_than))
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(interview_id, completed_at)| CompletionEvent {
                interview_id,
                completed_at,
            })
            .collect())
    }

    async fn mark_published(&self, interview_id: Uuid) -> Result<(), InterviewStoreError> {
        sqlx::query(
            "UPDATE interview_events SET published_at = now() \
            WHERE interview_id = $1 AND published_at IS NULL",
        )
        .bind(interview_id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}
