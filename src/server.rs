use crate::aggregator::Completion;
use crate::error::JobError;
use crate::finalizer::{self, FinalizeOutcome};
use crate::queue::{ExpiredLeases, RetryOutcome};
use crate::worker::{self, WorkMessage};
use crate::{Job, JobRef, Pipeline};
use anyhow::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// Notifications for the process embedding the dispatcher.
#[derive(Debug)]
pub enum PipelineMessage {
    JobCompleted(Uuid),
    JobRetried { job_id: Uuid, attempts: u32, error: String },
    JobDeadLettered { job_id: Uuid, error: String },
    InterviewFinalized { interview_id: Uuid, published: bool },
    QueueError(String),
}

/// Lease jobs from the durable queue and feed them to `workers_count` workers
/// until `cancel_token` fires.
pub async fn serve(
    cancel_token: CancellationToken,
    pipeline: Pipeline,
    workers_count: u16,
    send_to_client: mpsc::UnboundedSender<PipelineMessage>,
) -> Result<(), Error> {
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Job>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let pipeline = pipeline.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, pipeline, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = workers_count as u32;
    let mut poll = tokio::time::interval(pipeline.settings.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Jobs left processing by a crashed process become available again.
    if recover_expired(&pipeline, &send_to_client).await.is_err() {
        cancel_token.cancel();
    }

    while !cancel_token.is_cancelled() {
        if free_workers > 0 {
            match pipeline.queue.lease(free_workers, pipeline.settings.lease_duration).await {
                Ok(jobs) => {
                    for job in jobs {
                        debug!(message = "Dispatching job", job_id = %job.id, attempt = job.attempts);
                        send_to_queue.send(job).await?;
                        free_workers -= 1;
                    }
                }
                Err(err) => {
                    error!(message = "Failed to lease jobs", error = ?err);
                    if notify(&send_to_client, PipelineMessage::QueueError(err.to_string())).is_err() {
                        cancel_token.cancel();
                        break;
                    }
                }
            }
        }

        // Waiting for something to else to happen to continue...
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Look for newly queued, backed-off or expired jobs
            _ = poll.tick() => {
                if recover_expired(&pipeline, &send_to_client).await.is_err() {
                    cancel_token.cancel();
                    break;
                }
                resume_stale_events(&pipeline).await;
            },
            // Handle responses from workers
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobCompleted(job, completion)) => {
                        free_workers += 1;
                        if job_completed(&pipeline, &send_to_client, job, completion).await.is_err() {
                            cancel_token.cancel();
                            break;
                        }
                    },
                    Some(WorkMessage::JobFailed(job, error)) => {
                        free_workers += 1;
                        if job_failed(&pipeline, &send_to_client, job, error).await.is_err() {
                            cancel_token.cancel();
                            break;
                        }
                    },
                }
            },
        }
    }

    send_to_queue.close();
    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

/// Error meaning the client side of the notification channel is gone.
struct ClientGone;

fn notify(send_to_client: &mpsc::UnboundedSender<PipelineMessage>, message: PipelineMessage) -> Result<(), ClientGone> {
    send_to_client.send(message).map_err(|err| {
        error!(message = "Failed to send response to client", error = ?err);
        ClientGone
    })
}

async fn job_completed(
    pipeline: &Pipeline,
    send_to_client: &mpsc::UnboundedSender<PipelineMessage>,
    job: JobRef,
    completion: Completion,
) -> Result<(), ClientGone> {
    debug!(message = "Completed job", job_id = %job.id, completion = ?completion);
    if let Err(err) = pipeline.queue.complete(job.id).await {
        // The lease expires and the job reruns; recorded slots make that a no-op.
        warn!(message = "Failed to mark job completed", job_id = %job.id, error = ?err);
        notify(send_to_client, PipelineMessage::QueueError(err.to_string()))?;
    }
    notify(send_to_client, PipelineMessage::JobCompleted(job.id))?;

    if let Completion::Complete(FinalizeOutcome::Finalized { published }) = completion {
        notify(
            send_to_client,
            PipelineMessage::InterviewFinalized {
                interview_id: job.interview_id,
                published,
            },
        )?;
    }
    Ok(())
}

async fn job_failed(
    pipeline: &Pipeline,
    send_to_client: &mpsc::UnboundedSender<PipelineMessage>,
    job: JobRef,
    error: JobError,
) -> Result<(), ClientGone> {
    let message = error.to_string();

    if error.is_consistency_violation() {
        error!(message = "Data integrity violation", job_id = %job.id, error = %message);
        pipeline
            .alert(format!("data integrity violation in job {}: {message}", job.id))
            .await;
    }

    if !error.is_retryable() {
        warn!(message = "Dead-lettering job", job_id = %job.id, error = %message);
        if let Err(err) = pipeline.queue.dead_letter(job.id, &message).await {
            error!(message = "Failed to dead-letter job", job_id = %job.id, error = ?err);
            return notify(send_to_client, PipelineMessage::QueueError(err.to_string()));
        }
        dead_lettered(pipeline, &job, &message).await;
        return notify(
            send_to_client,
            PipelineMessage::JobDeadLettered {
                job_id: job.id,
                error: message,
            },
        );
    }

    let backoff = pipeline.settings.backoff_for(job.attempts);
    match pipeline.queue.retry(job.id, &message, backoff).await {
        Ok(RetryOutcome::Requeued { attempts }) => {
            debug!(message = "Job will be retried", job_id = %job.id, attempts, backoff = ?backoff, error = %message);
            notify(
                send_to_client,
                PipelineMessage::JobRetried {
                    job_id: job.id,
                    attempts,
                    error: message,
                },
            )
        }
        Ok(RetryOutcome::DeadLettered) => {
            warn!(message = "Job exhausted its attempts", job_id = %job.id, error = %message);
            dead_lettered(pipeline, &job, &message).await;
            notify(
                send_to_client,
                PipelineMessage::JobDeadLettered {
                    job_id: job.id,
                    error: message,
                },
            )
        }
        Err(err) => {
            error!(message = "Failed to requeue job", job_id = %job.id, error = ?err);
            notify(send_to_client, PipelineMessage::QueueError(err.to_string()))
        }
    }
}

/// Free the slots a dead job never recorded so the client can resubmit them,
/// and tell operators.
async fn dead_lettered(pipeline: &Pipeline, job: &JobRef, reason: &str) {
    for modality in &job.modalities {
        match pipeline.guard.release(job.interview_id, *modality, job.question_index).await {
            Ok(true) => debug!(message = "Released reservation", job_id = %job.id, %modality),
            Ok(false) => {}
            Err(err) => warn!(message = "Failed to release reservation", job_id = %job.id, %modality, error = ?err),
        }
    }
    pipeline
        .alert(format!(
            "job {} for interview {} question {} dead-lettered after {} attempt(s): {reason}",
            job.id, job.interview_id, job.question_index, job.attempts
        ))
        .await;
}

async fn recover_expired(
    pipeline: &Pipeline,
    send_to_client: &mpsc::UnboundedSender<PipelineMessage>,
) -> Result<(), ClientGone> {
    match pipeline.queue.requeue_expired().await {
        Ok(ExpiredLeases { requeued, dead_lettered: dead }) => {
            if requeued > 0 {
                info!(message = "Requeued jobs with expired leases", count = requeued);
            }
            for job in dead {
                dead_lettered(pipeline, &job, "lease expired on last attempt").await;
                notify(
                    send_to_client,
                    PipelineMessage::JobDeadLettered {
                        job_id: job.id,
                        error: "lease expired on last attempt".into(),
                    },
                )?;
            }
            Ok(())
        }
        Err(err) => {
            error!(message = "Failed to recover expired leases", error = ?err);
            notify(send_to_client, PipelineMessage::QueueError(err.to_string()))
        }
    }
}

/// Completion events left pending by attempts that died or gave up.
async fn resume_stale_events(pipeline: &Pipeline) {
    match finalizer::resume_stale(pipeline).await {
        Ok(0) => {}
        Ok(count) => info!(message = "Published stale completion events", count),
        Err(err) => warn!(message = "Failed to resume stale completion events", error = ?err),
    }
}
