//! Entry point contract: validate a submission, reserve its slots and queue
//! exactly one job for the newly reserved modalities.

use std::fmt;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{GuardError, IngestError};
use crate::guard::ReserveResult;
use crate::{media, InterviewStatus, JobRequest, MediaPayload, Modality, Pipeline};

/// A validated upload descriptor as handed over by the HTTP layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub interview_id: Uuid,
    pub question_index: u32,
    pub audio: Option<MediaPayload>,
    pub video: Option<MediaPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateSubmission,
    InvalidState(InterviewStatus),
    InvalidIndex { index: u32, count: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DuplicateSubmission => write!(f, "duplicate-submission"),
            RejectReason::InvalidState(status) => write!(f, "invalid-state ({status})"),
            RejectReason::InvalidIndex { index, count } => {
                write!(f, "invalid-index ({index} not in 0..{count})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted {
        job_id: Uuid,
        /// Modalities carried by the queued job.
        accepted: Vec<Modality>,
        /// Modalities of this submission rejected as duplicates.
        duplicates: Vec<Modality>,
    },
    Rejected(RejectReason),
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionOutcome::Accepted { .. })
    }
}

#[instrument(skip_all, fields(interview_id = %submission.interview_id, question_index = submission.question_index))]
pub async fn submit(pipeline: &Pipeline, submission: Submission) -> Result<SubmissionOutcome, IngestError> {
    let Submission {
        interview_id,
        question_index,
        audio,
        video,
    } = submission;

    let mut payloads: Vec<(Modality, MediaPayload)> = [(Modality::Audio, audio), (Modality::Video, video)]
        .into_iter()
        .filter_map(|(modality, payload)| payload.map(|p| (modality, p)))
        .collect();
    if payloads.is_empty() {
        return Err(IngestError::NoPayload);
    }
    for (modality, payload) in &payloads {
        media::validate(payload, *modality, pipeline.settings.max_payload_bytes)?;
    }

    let interview = pipeline
        .interviews
        .get(interview_id)
        .await?
        .ok_or(IngestError::InterviewNotFound(interview_id))?;
    if interview.status != InterviewStatus::Scheduled {
        debug!(message = "Rejecting submission", status = %interview.status);
        return Ok(SubmissionOutcome::Rejected(RejectReason::InvalidState(interview.status)));
    }
    let count = interview.question_count();
    if question_index as usize >= count {
        return Ok(SubmissionOutcome::Rejected(RejectReason::InvalidIndex {
            index: question_index,
            count,
        }));
    }

    let mut accepted = Vec::new();
    let mut duplicates = Vec::new();
    for (modality, _) in &payloads {
        match pipeline.guard.try_reserve(interview_id, *modality, question_index).await {
            Ok(ReserveResult::Accepted) => accepted.push(*modality),
            Ok(ReserveResult::AlreadyExists) => duplicates.push(*modality),
            // Finalized or cancelled after the status check above.
            Ok(ReserveResult::Closed(status)) => {
                debug!(message = "Interview closed while reserving", %status);
                release_all(pipeline, interview_id, question_index, &accepted).await;
                return Ok(SubmissionOutcome::Rejected(RejectReason::InvalidState(status)));
            }
            Err(GuardError::UnknownInterview(missing)) => {
                release_all(pipeline, interview_id, question_index, &accepted).await;
                return Err(IngestError::InterviewNotFound(missing));
            }
            Err(err) => {
                // Fail closed: undo what this call reserved and let the client retry.
                warn!(message = "Submission guard unavailable", error = ?err);
                release_all(pipeline, interview_id, question_index, &accepted).await;
                return Err(err.into());
            }
        }
    }
    if accepted.is_empty() {
        debug!(message = "Duplicate submission", ?duplicates);
        return Ok(SubmissionOutcome::Rejected(RejectReason::DuplicateSubmission));
    }

    payloads.retain(|(modality, _)| accepted.contains(modality));
    let mut request = JobRequest {
        interview_id,
        question_index,
        audio: None,
        video: None,
    };
    for (modality, payload) in payloads {
        match modality {
            Modality::Audio => request.audio = Some(payload),
            Modality::Video => request.video = Some(payload),
        }
    }

    let job_id = match pipeline.queue.enqueue(request, pipeline.settings.max_attempts).await {
        Ok(job_id) => job_id,
        Err(err) => {
            warn!(message = "Failed to enqueue job", error = ?err);
            release_all(pipeline, interview_id, question_index, &accepted).await;
            return Err(err.into());
        }
    };

    info!(message = "Submission accepted", %job_id, ?accepted, ?duplicates);
    Ok(SubmissionOutcome::Accepted {
        job_id,
        accepted,
        duplicates,
    })
}

async fn release_all(pipeline: &Pipeline, interview_id: Uuid, question_index: u32, modalities: &[Modality]) {
    for modality in modalities {
        if let Err(err) = pipeline.guard.release(interview_id, *modality, question_index).await {
            warn!(message = "Failed to release reservation", %modality, error = ?err);
        }
    }
}
