use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::{InterviewStatus, Modality};

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("submission store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("submission store unavailable: {0}")]
    Unavailable(String),

    #[error("interview {0} not found")]
    UnknownInterview(Uuid),

    #[error("no reservation for {interview_id}/{modality}/{question_index}")]
    NotReserved {
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    },

    #[error(
        "conflicting url for {interview_id}/{modality}/{question_index}: recorded {existing}, attempted {attempted}"
    )]
    Conflict {
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
        existing: String,
        attempted: String,
    },
}

impl GuardError {
    /// Outages worth retrying, as opposed to answers about the data.
    pub fn is_transient(&self) -> bool {
        matches!(self, GuardError::Database(_) | GuardError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job queue error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job has no payload")]
    EmptyJob,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("blob store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum InterviewStoreError {
    #[error("interview store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("interview {0} not found")]
    NotFound(Uuid),

    #[error("interview must have at least one question")]
    NoQuestions,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock store error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("failed to deliver alert: {0}")]
    Delivery(String),
}

/// Reasons a payload is refused. None of these are worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("{modality} payload is empty")]
    Empty { modality: Modality },

    #[error("{modality} payload is {size} bytes, limit is {limit}")]
    TooLarge { modality: Modality, size: usize, limit: usize },

    #[error("media type {media_type:?} is not accepted for {modality}")]
    UnsupportedType { modality: Modality, media_type: String },

    #[error("file {filename:?} has an extension not accepted for {modality}")]
    UnsupportedExtension { modality: Modality, filename: String },

    #[error("{modality} payload {filename:?} does not look like a valid container")]
    Corrupt { modality: Modality, filename: String },
}

/// Errors from the ingestion entry point that are not plain rejections.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("interview {0} not found")]
    InterviewNotFound(Uuid),

    #[error("submission carries neither audio nor video")]
    NoPayload,

    #[error(transparent)]
    InvalidPayload(#[from] MediaError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] InterviewStoreError),
}

impl IngestError {
    /// Whether the client may resubmit unchanged. Store outages fail closed
    /// and are retryable; validation failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::InterviewNotFound(_) | IngestError::NoPayload | IngestError::InvalidPayload(_) => false,
            IngestError::Guard(err) => err.is_transient(),
            IngestError::Queue(err) => !matches!(err, QueueError::EmptyJob),
            IngestError::Store(err) => matches!(err, InterviewStoreError::Database(_)),
        }
    }
}

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("interview {0} no longer exists")]
    InterviewMissing(Uuid),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] InterviewStoreError),

    #[error(transparent)]
    Guard(#[from] GuardError),
}

/// Failure of a single job attempt, classified for the retry policy.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("job has no payload")]
    EmptyJob,

    #[error("interview {0} no longer exists")]
    InterviewMissing(Uuid),

    #[error("interview {interview_id} is {status}, not accepting media")]
    InterviewClosed { interview_id: Uuid, status: InterviewStatus },

    #[error("question index {index} out of range for {count} questions")]
    IndexOutOfRange { index: u32, count: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] MediaError),

    #[error("upload of {modality} failed: {source}")]
    Upload {
        modality: Modality,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Store(#[from] InterviewStoreError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Whether the queue should redeliver the job.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::EmptyJob
            | JobError::InterviewMissing(_)
            | JobError::InterviewClosed { .. }
            | JobError::IndexOutOfRange { .. }
            | JobError::InvalidPayload(_)
            | JobError::Finalize(FinalizeError::InterviewMissing(_)) => false,
            JobError::Guard(err) | JobError::Finalize(FinalizeError::Guard(err)) => err.is_transient(),
            JobError::Upload { .. } | JobError::Store(_) | JobError::Finalize(_) | JobError::Timeout(_) => true,
        }
    }

    /// Data-integrity failures that must be surfaced loudly.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            JobError::Guard(GuardError::Conflict { .. }) | JobError::Finalize(FinalizeError::Guard(GuardError::Conflict { .. }))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn conflict() -> GuardError {
        GuardError::Conflict {
            interview_id: Uuid::nil(),
            modality: Modality::Audio,
            question_index: 0,
            existing: "a".into(),
            attempted: "b".into(),
        }
    }

    #[rstest]
    #[case(JobError::EmptyJob, false)]
    #[case(JobError::InterviewMissing(Uuid::nil()), false)]
    #[case(JobError::InvalidPayload(MediaError::Empty { modality: Modality::Video }), false)]
    #[case(JobError::Guard(conflict()), false)]
    #[case(JobError::Guard(GuardError::Unavailable("down".into())), true)]
    #[case(JobError::Guard(GuardError::NotReserved { interview_id: Uuid::nil(), modality: Modality::Audio, question_index: 0 }), false)]
    #[case(JobError::Upload { modality: Modality::Audio, source: StorageError::Unavailable("503".into()) }, true)]
    #[case(JobError::Timeout(Duration::from_secs(1)), true)]
    #[case(JobError::Finalize(FinalizeError::InterviewMissing(Uuid::nil())), false)]
    #[case(JobError::Finalize(FinalizeError::Store(InterviewStoreError::NotFound(Uuid::nil()))), true)]
    fn classifies_retryable_errors(#[case] error: JobError, #[case] retryable: bool) {
        assert_eq!(error.is_retryable(), retryable, "{error}");
    }

    #[test]
    fn guard_outage_at_entry_is_retryable() {
        assert!(IngestError::Guard(GuardError::Unavailable("down".into())).is_retryable());
        assert!(IngestError::Queue(QueueError::Database(sqlx::Error::PoolTimedOut)).is_retryable());
        assert!(!IngestError::NoPayload.is_retryable());
        assert!(!IngestError::InvalidPayload(MediaError::Empty { modality: Modality::Audio }).is_retryable());
    }

    #[test]
    fn conflict_is_a_consistency_violation() {
        assert!(JobError::Guard(conflict()).is_consistency_violation());
        assert!(!JobError::EmptyJob.is_consistency_violation());
    }
}
