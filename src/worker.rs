use async_channel::Receiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::aggregator::{self, Completion};
use crate::error::JobError;
use crate::finalizer;
use crate::guard::RecordResult;
use crate::{media, storage, InterviewStatus, Job, JobRef, Pipeline};

#[derive(Debug)]
pub enum WorkMessage {
    JobCompleted(JobRef, Completion),
    JobFailed(JobRef, JobError),
}

pub async fn start(
    cancel_token: CancellationToken,
    pipeline: Pipeline,
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    let timeout = pipeline.settings.job_timeout;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        debug!(message = "Job channel closed, worker exiting", error = ?err);
                        break;
                    },
                    Ok(job) => {
                        let job_ref = job.job_ref();
                        let result = match tokio::time::timeout(timeout, process(&pipeline, &job)).await {
                            Ok(result) => result,
                            Err(_) => Err(JobError::Timeout(timeout)),
                        };
                        let message = match result {
                            Ok(completion) => WorkMessage::JobCompleted(job_ref, completion),
                            Err(err) => WorkMessage::JobFailed(job_ref, err),
                        };
                        if send_to_server.send(message).is_err() {
                            // The lease expires and the job is redelivered elsewhere.
                            error!("Dispatcher is gone, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

/// Upload every payload of `job`, record the urls and evaluate completion.
///
/// Modalities already recorded by an earlier attempt are skipped, so a retry
/// of a partially processed job only redoes what failed.
#[instrument(skip_all, fields(job_id = %job.id, interview_id = %job.interview_id, question_index = job.question_index, attempt = job.attempts))]
pub async fn process(pipeline: &Pipeline, job: &Job) -> Result<Completion, JobError> {
    let modalities = job.modalities();
    if modalities.is_empty() {
        return Err(JobError::EmptyJob);
    }

    let interview = pipeline
        .interviews
        .get(job.interview_id)
        .await?
        .ok_or(JobError::InterviewMissing(job.interview_id))?;
    match interview.status {
        InterviewStatus::Scheduled => {}
        // Redelivery of a job whose attempt already completed the interview.
        // That attempt may have died before publishing, so let the finalizer
        // finish its side effects.
        InterviewStatus::Completed => {
            debug!("Interview already completed");
            let outcome = finalizer::finalize(pipeline, job.interview_id).await?;
            return Ok(Completion::Complete(outcome));
        }
        status => {
            return Err(JobError::InterviewClosed {
                interview_id: interview.id,
                status,
            })
        }
    }
    if job.question_index as usize >= interview.question_count() {
        return Err(JobError::IndexOutOfRange {
            index: job.question_index,
            count: interview.question_count(),
        });
    }

    for modality in modalities {
        let Some(payload) = job.payload(modality) else {
            continue;
        };

        if let Some(url) = pipeline
            .guard
            .recorded_url(job.interview_id, modality, job.question_index)
            .await?
        {
            debug!(message = "Already recorded", %modality, url = %url);
            continue;
        }

        media::validate(payload, modality, pipeline.settings.max_payload_bytes)?;

        let key = storage::object_key(job.interview_id, modality, job.question_index, &payload.filename);
        let url = pipeline
            .blobs
            .put(&key, &payload.bytes, &payload.media_type)
            .await
            .map_err(|source| JobError::Upload { modality, source })?;

        match pipeline
            .guard
            .record(job.interview_id, modality, job.question_index, &url)
            .await?
        {
            RecordResult::Recorded => info!(message = "Recorded upload", %modality, url = %url),
            RecordResult::Unchanged => debug!(message = "Upload already recorded", %modality),
        }
    }

    Ok(aggregator::evaluate(pipeline, job.interview_id).await?)
}
