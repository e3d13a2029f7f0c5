use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::db::interval_secs;
use crate::error::QueueError;
use crate::{Job, JobRef, JobRequest, JobStatus, MediaPayload, Modality};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued { attempts: u32 },
    DeadLettered,
}

/// Result of sweeping jobs whose lease ran out.
#[derive(Debug, Default)]
pub struct ExpiredLeases {
    pub requeued: u64,
    /// Jobs that were out of attempts and moved to the dead-letter state.
    pub dead_lettered: Vec<JobRef>,
}

/// Durable queue handing each job to one worker at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, request: JobRequest, max_attempts: u32) -> Result<Uuid, QueueError>;

    /// Lease up to `limit` ready jobs. A leased job is invisible to other
    /// callers until completed, retried, or its lease expires.
    async fn lease(&self, limit: u32, lease: Duration) -> Result<Vec<Job>, QueueError>;

    /// Mark a job done and drop its payload bytes.
    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Return a failed job to the queue after `backoff`, or dead-letter it once
    /// it has used all of its attempts.
    async fn retry(&self, job_id: Uuid, error: &str, backoff: Duration) -> Result<RetryOutcome, QueueError>;

    async fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<(), QueueError>;

    async fn requeue_expired(&self) -> Result<ExpiredLeases, QueueError>;

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, QueueError>;
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    interview_id: Uuid,
    question_index: i32,
    audio_bytes: Option<Vec<u8>>,
    audio_filename: Option<String>,
    audio_media_type: Option<String>,
    video_bytes: Option<Vec<u8>>,
    video_filename: Option<String>,
    video_media_type: Option<String>,
    attempts: i32,
    max_attempts: i32,
}

fn payload(bytes: Option<Vec<u8>>, filename: Option<String>, media_type: Option<String>) -> Option<MediaPayload> {
    Some(MediaPayload {
        bytes: bytes?,
        filename: filename.unwrap_or_default(),
        media_type: media_type.unwrap_or_default(),
    })
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            interview_id: row.interview_id,
            question_index: row.question_index as u32,
            audio: payload(row.audio_bytes, row.audio_filename, row.audio_media_type),
            video: payload(row.video_bytes, row.video_filename, row.video_media_type),
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExpiredRow {
    status: JobStatus,
    id: Uuid,
    interview_id: Uuid,
    question_index: i32,
    attempts: i32,
    has_audio: bool,
    has_video: bool,
}

const JOB_COLUMNS: &str = "id, interview_id, question_index, \
    audio_bytes, audio_filename, audio_media_type, \
    video_bytes, video_filename, video_media_type, \
    attempts, max_attempts";

pub struct PgJobQueue {
    pool: Arc<PgPool>,
}

impl PgJobQueue {
    pub fn new(pool: Arc<PgPool>) -> Self {
        PgJobQueue { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, request: JobRequest, max_attempts: u32) -> Result<Uuid, QueueError> {
        if request.audio.is_none() && request.video.is_none() {
            return Err(QueueError::EmptyJob);
        }
        debug!("Submitting job {:?}", request);

        let id = Uuid::new_v4();
        let audio = request.audio.as_ref();
        let video = request.video.as_ref();
        sqlx::query(
            "INSERT INTO ingest_jobs \
            (id, interview_id, question_index, \
             audio_bytes, audio_filename, audio_media_type, \
             video_bytes, video_filename, video_media_type, \
             max_attempts, status) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'QUEUED')",
        )
        .bind(id)
        .bind(request.interview_id)
        .bind(request.question_index as i32)
        .bind(audio.map(|p| p.bytes.as_slice()))
        .bind(audio.map(|p| p.filename.as_str()))
        .bind(audio.map(|p| p.media_type.as_str()))
        .bind(video.map(|p| p.bytes.as_slice()))
        .bind(video.map(|p| p.filename.as_str()))
        .bind(video.map(|p| p.media_type.as_str()))
        .bind(max_attempts as i32)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn lease(&self, limit: u32, lease: Duration) -> Result<Vec<Job>, QueueError> {
        debug!("Leasing up to {} queued jobs", limit);
        let query = format!(
            "UPDATE ingest_jobs \
                SET status = 'PROCESSING', \
                attempts = attempts + 1, \
                started_at = now(), \
                lease_expires_at = now() + make_interval(secs => $2) \
            WHERE id IN ( \
                SELECT id FROM ingest_jobs \
                WHERE status = 'QUEUED' AND available_at <= now() \
                ORDER BY available_at ASC, created_at ASC \
                LIMIT $1 \
                FOR UPDATE SKIP LOCKED) \
            RETURNING {JOB_COLUMNS}"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&query)
            .bind(limit as i64)
            .bind(interval_secs(lease))
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        // Media now lives in blob storage; dead-lettered rows keep theirs.
        let result = sqlx::query(
            "UPDATE ingest_jobs \
                SET status = 'COMPLETED', \
                lease_expires_at = NULL, \
                last_error = NULL, \
                audio_bytes = NULL, \
                video_bytes = NULL \
            WHERE id = $1",
        )
        .bind(job_id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn retry(&self, job_id: Uuid, error: &str, backoff: Duration) -> Result<RetryOutcome, QueueError> {
        let row: Option<(JobStatus, i32)> = sqlx::query_as(
            "UPDATE ingest_jobs \
                SET status = CASE WHEN attempts >= max_attempts \
                    THEN 'DEAD_LETTER'::ingest_job_status \
                    ELSE 'QUEUED'::ingest_job_status END, \
                available_at = now() + make_interval(secs => $3), \
                lease_expires_at = NULL, \
                last_error = $2 \
            WHERE id = $1 \
            RETURNING status, attempts",
        )
        .bind(job_id)
        .bind(error)
        .bind(interval_secs(backoff))
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            None => Err(QueueError::NotFound(job_id)),
            Some((JobStatus::DeadLetter, _)) => Ok(RetryOutcome::DeadLettered),
            Some((_, attempts)) => Ok(RetryOutcome::Requeued {
                attempts: attempts as u32,
            }),
        }
    }

    async fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE ingest_jobs \
                SET status = 'DEAD_LETTER', \
                lease_expires_at = NULL, \
                last_error = $2 \
            WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<ExpiredLeases, QueueError> {
        let rows: Vec<ExpiredRow> = sqlx::query_as(
            "UPDATE ingest_jobs \
                SET status = CASE WHEN attempts >= max_attempts \
                    THEN 'DEAD_LETTER'::ingest_job_status \
                    ELSE 'QUEUED'::ingest_job_status END, \
                lease_expires_at = NULL, \
                last_error = 'lease expired' \
            WHERE status = 'PROCESSING' AND lease_expires_at < now() \
            RETURNING status, id, interview_id, question_index, attempts, \
                audio_bytes IS NOT NULL AS has_audio, \
                video_bytes IS NOT NULL AS has_video",
        )
        .fetch_all(&*self.pool)
        .await?;

        let mut expired = ExpiredLeases::default();
        for row in rows {
            if row.status != JobStatus::DeadLetter {
                expired.requeued += 1;
                continue;
            }
            let modalities = [(Modality::Audio, row.has_audio), (Modality::Video, row.has_video)]
                .into_iter()
                .filter(|(_, present)| *present)
                .map(|(modality, _)| modality)
                .collect();
            expired.dead_lettered.push(JobRef {
                id: row.id,
                interview_id: row.interview_id,
                question_index: row.question_index as u32,
                modalities,
                attempts: row.attempts as u32,
            });
        }
        Ok(expired)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        Ok(sqlx::query_scalar("SELECT status FROM ingest_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&*self.pool)
            .await?)
    }
}
