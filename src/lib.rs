use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod aggregator;
pub mod alert;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod guard;
pub mod ingest;
pub mod interviews;
pub mod lock;
pub mod media;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use pipeline::{Pipeline, PipelineSettings};

/// One of the two media kinds collected per question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "media_modality", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Audio,
    Video,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Audio, Modality::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Audio => "audio",
            Modality::Video => "video",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw media bytes together with what the client declared about them.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub media_type: String,
}

impl fmt::Debug for MediaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPayload")
            .field("len", &self.bytes.len())
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .finish()
    }
}

/// Request to queue the upload of one slot's media.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub interview_id: Uuid,
    pub question_index: u32,
    pub audio: Option<MediaPayload>,
    pub video: Option<MediaPayload>,
}

/// A leased unit of work: one or two payloads for a single slot.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub interview_id: Uuid,
    pub question_index: u32,
    pub audio: Option<MediaPayload>,
    pub video: Option<MediaPayload>,
    /// Number of deliveries so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Job {
    pub fn payload(&self, modality: Modality) -> Option<&MediaPayload> {
        match modality {
            Modality::Audio => self.audio.as_ref(),
            Modality::Video => self.video.as_ref(),
        }
    }

    pub fn modalities(&self) -> Vec<Modality> {
        Modality::ALL
            .into_iter()
            .filter(|m| self.payload(*m).is_some())
            .collect()
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id,
            interview_id: self.interview_id,
            question_index: self.question_index,
            modalities: self.modalities(),
            attempts: self.attempts,
        }
    }
}

/// Job identity without the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: Uuid,
    pub interview_id: Uuid,
    pub question_index: u32,
    pub modalities: Vec<Modality>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "ingest_job_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "interview_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InterviewStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterviewStatus::Scheduled => "scheduled",
            InterviewStatus::Completed => "completed",
            InterviewStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub audio_url: Option<String>,
    pub video_url: Option<String>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Question {
            text: text.into(),
            audio_url: None,
            video_url: None,
        }
    }

    pub fn url(&self, modality: Modality) -> Option<&str> {
        match modality {
            Modality::Audio => self.audio_url.as_deref(),
            Modality::Video => self.video_url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interview {
    pub id: Uuid,
    pub questions: Vec<Question>,
    pub status: InterviewStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Interview {
    pub fn question_count(&self) -> usize {
        self.questions.len()
    }
}
