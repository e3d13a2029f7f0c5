//! Single-writer completion of an interview.
//!
//! Many workers may see the completion predicate hold at the same time. Only
//! the caller that takes the interview's finalization lock and wins the
//! conditional `scheduled -> completed` write merges media, publishes the
//! completion event and clears the submission guard. Everyone else returns
//! without side effects.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::FinalizeError;
use crate::events::CompletionEvent;
use crate::lock::LockResult;
use crate::{InterviewStatus, Modality, Pipeline, Question};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This caller completed the interview. `published` is false when every
    /// publish attempt failed and operators were alerted.
    Finalized { published: bool },
    /// Another caller holds the finalization lock.
    AlreadyClaimed,
    AlreadyFinalized,
    NotScheduled(InterviewStatus),
}

pub fn lock_key(interview_id: Uuid) -> String {
    format!("finalize:{interview_id}")
}

/// Fill question media from the recorded urls, keeping existing values
/// where nothing was recorded for an index.
pub fn merge_media(
    questions: &[Question],
    audio: &BTreeMap<u32, String>,
    video: &BTreeMap<u32, String>,
) -> Vec<Question> {
    questions
        .iter()
        .enumerate()
        .map(|(i, question)| {
            let index = i as u32;
            Question {
                text: question.text.clone(),
                audio_url: audio.get(&index).cloned().or_else(|| question.audio_url.clone()),
                video_url: video.get(&index).cloned().or_else(|| question.video_url.clone()),
            }
        })
        .collect()
}

/// Claim on an interview's finalization lock.
struct Claim {
    key: String,
    owner: String,
}

impl Claim {
    async fn acquire(pipeline: &Pipeline, interview_id: Uuid) -> Result<Option<Claim>, FinalizeError> {
        let key = lock_key(interview_id);
        let owner = Uuid::new_v4().to_string();

        match pipeline
            .locks
            .acquire(&key, &owner, pipeline.settings.lock_expiry)
            .await?
        {
            LockResult::Acquired => Ok(Some(Claim { key, owner })),
            LockResult::AlreadyHeld(holder) => {
                debug!(message = "Finalization already claimed", holder = %holder);
                Ok(None)
            }
            other => {
                warn!(message = "Unexpected lock result", result = ?other);
                Ok(None)
            }
        }
    }

    async fn release(self, pipeline: &Pipeline) {
        if let Err(err) = pipeline.locks.release(&self.key, &self.owner).await {
            warn!(message = "Failed to release finalization lock, it will expire", error = ?err);
        }
    }
}

#[instrument(skip(pipeline))]
pub async fn finalize(pipeline: &Pipeline, interview_id: Uuid) -> Result<FinalizeOutcome, FinalizeError> {
    let Some(claim) = Claim::acquire(pipeline, interview_id).await? else {
        return Ok(FinalizeOutcome::AlreadyClaimed);
    };

    let result = finalize_claimed(pipeline, interview_id).await;

    // Released on success too: later callers then see the completed status.
    claim.release(pipeline).await;
    result
}

async fn finalize_claimed(pipeline: &Pipeline, interview_id: Uuid) -> Result<FinalizeOutcome, FinalizeError> {
    let interview = pipeline
        .interviews
        .get(interview_id)
        .await?
        .ok_or(FinalizeError::InterviewMissing(interview_id))?;
    match interview.status {
        InterviewStatus::Scheduled => {}
        InterviewStatus::Completed => {
            resume_completed(pipeline, interview_id).await?;
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        status => return Ok(FinalizeOutcome::NotScheduled(status)),
    }

    let audio = pipeline.guard.read_all(interview_id, Modality::Audio).await?;
    let video = pipeline.guard.read_all(interview_id, Modality::Video).await?;
    let questions = merge_media(&interview.questions, &audio, &video);

    let event = CompletionEvent {
        interview_id,
        completed_at: Utc::now(),
    };
    if !pipeline.interviews.complete(interview_id, &questions, &event).await? {
        debug!("Interview left scheduled state before persisting");
        return Ok(FinalizeOutcome::AlreadyFinalized);
    }
    info!(message = "Interview completed", questions = questions.len());

    let published = publish_or_alert(pipeline, &event).await;
    clear_guard(pipeline, interview_id).await;

    Ok(FinalizeOutcome::Finalized { published })
}

/// Finish what an interrupted finalization left behind: a completion event
/// that was never published and guard entries that were never cleared.
async fn resume_completed(pipeline: &Pipeline, interview_id: Uuid) -> Result<(), FinalizeError> {
    if let Some(event) = pipeline.interviews.pending_event(interview_id).await? {
        info!(message = "Resuming unpublished completion event");
        publish_or_alert(pipeline, &event).await;
    }
    clear_guard(pipeline, interview_id).await;
    Ok(())
}

async fn clear_guard(pipeline: &Pipeline, interview_id: Uuid) {
    for modality in Modality::ALL {
        if let Err(err) = pipeline.guard.clear(interview_id, modality).await {
            warn!(message = "Failed to clear submissions", %modality, error = ?err);
        }
    }
}

/// Publish `event` and mark it published. The interview is already durably
/// completed here, so failures only retry the publish itself.
async fn publish(pipeline: &Pipeline, event: &CompletionEvent, attempts: u32) -> bool {
    for attempt in 1..=attempts {
        match pipeline.events.publish(event).await {
            Ok(()) => {
                if let Err(err) = pipeline.interviews.mark_published(event.interview_id).await {
                    // Published again by a later sweep; consumers dedupe.
                    warn!(message = "Failed to mark completion event published", error = ?err);
                }
                return true;
            }
            Err(err) => {
                warn!(message = "Failed to publish completion event", attempt, error = ?err);
                if attempt < attempts {
                    tokio::time::sleep(pipeline.settings.publish_backoff.saturating_mul(attempt)).await;
                }
            }
        }
    }
    false
}

async fn publish_or_alert(pipeline: &Pipeline, event: &CompletionEvent) -> bool {
    let attempts = pipeline.settings.publish_attempts.max(1);
    if publish(pipeline, event, attempts).await {
        return true;
    }

    error!(message = "Giving up on completion event for now", interview_id = %event.interview_id);
    pipeline
        .alert(format!(
            "completion event for interview {} could not be published after {attempts} attempts; it stays pending",
            event.interview_id
        ))
        .await;
    false
}

/// Publish completion events still pending after a full job timeout, when the
/// attempt that completed the interview can no longer be running. One publish
/// attempt per event and sweep. Returns how many were published.
#[instrument(skip_all)]
pub async fn resume_stale(pipeline: &Pipeline) -> Result<usize, FinalizeError> {
    let stale = pipeline.interviews.pending_events(pipeline.settings.job_timeout).await?;
    let mut published = 0;
    for event in stale {
        let Some(claim) = Claim::acquire(pipeline, event.interview_id).await? else {
            continue;
        };
        // Re-read under the claim; a redelivered job may have published it.
        let sent = match pipeline.interviews.pending_event(event.interview_id).await {
            Ok(Some(event)) => publish(pipeline, &event, 1).await,
            Ok(None) => false,
            Err(err) => {
                claim.release(pipeline).await;
                return Err(err.into());
            }
        };
        claim.release(pipeline).await;
        if sent {
            info!(message = "Published stale completion event", interview_id = %event.interview_id);
            published += 1;
        }
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EventError, InterviewStoreError};
    use crate::events::MockEventPublisher;
    use crate::interviews::{InterviewStore, MockInterviewStore};
    use crate::lock::MockLockClient;
    use crate::memory::MemoryBackend;
    use crate::PipelineSettings;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            publish_backoff: Duration::from_millis(1),
            publish_attempts: 3,
            ..Default::default()
        }
    }

    async fn fully_recorded(backend: &MemoryBackend, questions: usize) -> Uuid {
        let id = backend.create_interview(questions).await.unwrap().id;
        for i in 0..questions as u32 {
            for modality in Modality::ALL {
                backend.guard.insert_recorded(id, modality, i, &format!("mem://{id}/{modality}/{i}"));
            }
        }
        id
    }

    #[test]
    fn merge_keeps_existing_urls_without_entries() {
        let questions = vec![
            Question {
                text: "q0".into(),
                audio_url: Some("old-audio".into()),
                video_url: None,
            },
            Question::new("q1"),
        ];
        let audio = BTreeMap::from([(1, "a1".to_string())]);
        let video = BTreeMap::from([(0, "v0".to_string()), (1, "v1".to_string())]);

        let merged = merge_media(&questions, &audio, &video);
        assert_eq!(merged[0].audio_url.as_deref(), Some("old-audio"));
        assert_eq!(merged[0].video_url.as_deref(), Some("v0"));
        assert_eq!(merged[1].audio_url.as_deref(), Some("a1"));
        assert_eq!(merged[1].video_url.as_deref(), Some("v1"));
        assert_eq!(merged[1].text, "q1");
    }

    #[tokio::test]
    async fn finalizes_once_and_clears_guard() {
        let backend = MemoryBackend::default();
        let pipeline = backend.pipeline(settings());
        let id = fully_recorded(&backend, 2).await;

        let first = finalize(&pipeline, id).await.unwrap();
        assert_eq!(first, FinalizeOutcome::Finalized { published: true });
        let second = finalize(&pipeline, id).await.unwrap();
        assert_eq!(second, FinalizeOutcome::AlreadyFinalized);

        let interview = backend.interviews.get(id).await.unwrap().unwrap();
        assert_eq!(interview.status, InterviewStatus::Completed);
        assert_eq!(interview.questions[1].video_url, Some(format!("mem://{id}/video/1")));
        assert_eq!(backend.events.published_for(id), 1);
        assert!(backend.guard.is_empty());
    }

    #[tokio::test]
    async fn lost_claim_has_no_side_effects() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;

        let mut locks = MockLockClient::new();
        locks
            .expect_acquire()
            .returning(|_, _, _| Ok(LockResult::AlreadyHeld("other-worker".into())));
        locks.expect_release().never();
        let mut pipeline = backend.pipeline(settings());
        pipeline.locks = Arc::new(locks);

        assert_eq!(finalize(&pipeline, id).await.unwrap(), FinalizeOutcome::AlreadyClaimed);
        assert_eq!(backend.events.published_for(id), 0);
        assert!(!backend.guard.is_empty());
    }

    #[tokio::test]
    async fn persist_failure_releases_claim_and_skips_publish() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;
        let snapshot = backend.interviews.get(id).await.unwrap();

        let mut interviews = MockInterviewStore::new();
        interviews.expect_get().returning(move |_| Ok(snapshot.clone()));
        interviews
            .expect_complete()
            .times(1)
            .returning(|_, _, _| Err(InterviewStoreError::Database(sqlx::Error::PoolTimedOut)));
        let mut events = MockEventPublisher::new();
        events.expect_publish().never();

        let mut pipeline = backend.pipeline(settings());
        pipeline.interviews = Arc::new(interviews);
        pipeline.events = Arc::new(events);

        let err = finalize(&pipeline, id).await.unwrap_err();
        assert!(matches!(err, FinalizeError::Store(_)));
        assert!(!backend.guard.is_empty());
        assert!(!backend.locks.is_held(&lock_key(id)));

        // A later attempt with a healthy store succeeds.
        let pipeline = backend.pipeline(settings());
        assert_eq!(
            finalize(&pipeline, id).await.unwrap(),
            FinalizeOutcome::Finalized { published: true }
        );
    }

    #[tokio::test]
    async fn publish_is_retried_without_repersisting() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;

        let mut events = MockEventPublisher::new();
        let mut seq = mockall::Sequence::new();
        events
            .expect_publish()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(EventError::Unavailable("broker down".into())));
        events.expect_publish().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        let mut pipeline = backend.pipeline(settings());
        pipeline.events = Arc::new(events);

        assert_eq!(
            finalize(&pipeline, id).await.unwrap(),
            FinalizeOutcome::Finalized { published: true }
        );
        assert_eq!(backend.interviews.completions(id), 1);
    }

    #[tokio::test]
    async fn exhausted_publish_alerts_operators() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .times(3)
            .returning(|_| Err(EventError::Unavailable("broker down".into())));
        let mut pipeline = backend.pipeline(settings());
        pipeline.events = Arc::new(events);

        assert_eq!(
            finalize(&pipeline, id).await.unwrap(),
            FinalizeOutcome::Finalized { published: false }
        );
        assert_eq!(backend.alerts.messages().len(), 1);
        let interview = backend.interviews.get(id).await.unwrap().unwrap();
        assert_eq!(interview.status, InterviewStatus::Completed);
        assert!(backend.interviews.pending_event(id).await.unwrap().is_some());

        // The sweep publishes it once the broker is back.
        let pipeline = backend.pipeline(PipelineSettings {
            job_timeout: Duration::ZERO,
            ..settings()
        });
        assert_eq!(resume_stale(&pipeline).await.unwrap(), 1);
        assert_eq!(backend.events.published_for(id), 1);
        assert!(backend.interviews.pending_event(id).await.unwrap().is_none());
        assert_eq!(resume_stale(&pipeline).await.unwrap(), 0);
        assert_eq!(backend.events.published_for(id), 1);
    }

    #[tokio::test]
    async fn sweep_leaves_recent_events_to_their_job() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .returning(|_| Err(EventError::Unavailable("broker down".into())));
        let mut pipeline = backend.pipeline(settings());
        pipeline.events = Arc::new(events);
        finalize(&pipeline, id).await.unwrap();

        let pipeline = backend.pipeline(PipelineSettings {
            job_timeout: Duration::from_secs(600),
            ..settings()
        });
        assert_eq!(resume_stale(&pipeline).await.unwrap(), 0);
        assert_eq!(backend.events.published_for(id), 0);
        assert!(backend.interviews.pending_event(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_skips_claimed_interviews() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .returning(|_| Err(EventError::Unavailable("broker down".into())));
        let mut pipeline = backend.pipeline(settings());
        pipeline.events = Arc::new(events);
        finalize(&pipeline, id).await.unwrap();

        let mut locks = MockLockClient::new();
        locks
            .expect_acquire()
            .returning(|_, _, _| Ok(LockResult::AlreadyHeld("redelivered-job".into())));
        let mut pipeline = backend.pipeline(PipelineSettings {
            job_timeout: Duration::ZERO,
            ..settings()
        });
        pipeline.locks = Arc::new(locks);
        assert_eq!(resume_stale(&pipeline).await.unwrap(), 0);
        assert_eq!(backend.events.published_for(id), 0);
    }

    #[tokio::test]
    async fn redelivery_after_completion_publishes_pending_event() {
        let backend = MemoryBackend::default();
        let id = fully_recorded(&backend, 1).await;

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .returning(|_| Err(EventError::Unavailable("broker down".into())));
        let mut pipeline = backend.pipeline(settings());
        pipeline.events = Arc::new(events);
        finalize(&pipeline, id).await.unwrap();

        let pipeline = backend.pipeline(settings());
        assert_eq!(finalize(&pipeline, id).await.unwrap(), FinalizeOutcome::AlreadyFinalized);
        assert_eq!(backend.events.published_for(id), 1);
        assert!(backend.interviews.pending_event(id).await.unwrap().is_none());
        assert_eq!(backend.interviews.completions(id), 1);
    }

    #[tokio::test]
    async fn cancelled_interview_is_not_finalized() {
        let backend = MemoryBackend::default();
        let pipeline = backend.pipeline(settings());
        let id = fully_recorded(&backend, 1).await;
        backend.interviews.set_status(id, InterviewStatus::Cancelled);

        assert_eq!(
            finalize(&pipeline, id).await.unwrap(),
            FinalizeOutcome::NotScheduled(InterviewStatus::Cancelled)
        );
        assert_eq!(backend.events.published_for(id), 0);
    }
}
