//! In-process implementations of every pipeline client.
//!
//! State lives behind mutexes in this process only, so this backend suits
//! tests and single-process trials. It does not survive a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::alert::AlertClient;
use crate::error::{AlertError, EventError, GuardError, InterviewStoreError, LockError, QueueError, StorageError};
use crate::events::{CompletionEvent, EventPublisher};
use crate::guard::{RecordResult, ReserveResult, SubmissionGuard};
use crate::interviews::InterviewStore;
use crate::lock::{LockClient, LockResult};
use crate::queue::{ExpiredLeases, JobQueue, RetryOutcome};
use crate::storage::BlobStore;
use crate::{Interview, InterviewStatus, Job, JobRequest, JobStatus, Modality, Pipeline, PipelineSettings, Question};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not wedge the others.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every in-memory client, shared between the pipeline and test assertions.
#[derive(Clone)]
pub struct MemoryBackend {
    pub interviews: Arc<MemoryInterviewStore>,
    pub guard: Arc<MemorySubmissionGuard>,
    pub queue: Arc<MemoryJobQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub locks: Arc<MemoryLockClient>,
    pub events: Arc<MemoryEventPublisher>,
    pub alerts: Arc<MemoryAlertClient>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let interviews = Arc::new(MemoryInterviewStore::default());
        MemoryBackend {
            guard: Arc::new(MemorySubmissionGuard::linked(interviews.clone())),
            interviews,
            queue: Default::default(),
            blobs: Default::default(),
            locks: Default::default(),
            events: Default::default(),
            alerts: Default::default(),
        }
    }
}

impl MemoryBackend {
    pub fn pipeline(&self, settings: PipelineSettings) -> Pipeline {
        Pipeline {
            interviews: self.interviews.clone(),
            guard: self.guard.clone(),
            queue: self.queue.clone(),
            blobs: self.blobs.clone(),
            locks: self.locks.clone(),
            events: self.events.clone(),
            alerts: self.alerts.clone(),
            settings: Arc::new(settings),
        }
    }

    /// Create a scheduled interview with `questions` placeholder questions.
    pub async fn create_interview(&self, questions: usize) -> Result<Interview, InterviewStoreError> {
        let texts = (0..questions).map(|i| format!("Question {}", i + 1)).collect();
        self.interviews.create(texts).await
    }
}

#[derive(Default)]
pub struct MemoryInterviewStore {
    interviews: Mutex<HashMap<Uuid, Interview>>,
    completions: Mutex<HashMap<Uuid, usize>>,
    /// Completion events and whether each was marked published.
    outbox: Mutex<HashMap<Uuid, (CompletionEvent, bool)>>,
}

impl MemoryInterviewStore {
    pub fn set_status(&self, interview_id: Uuid, status: InterviewStatus) {
        if let Some(interview) = lock(&self.interviews).get_mut(&interview_id) {
            interview.status = status;
        }
    }

    pub fn remove(&self, interview_id: Uuid) {
        lock(&self.interviews).remove(&interview_id);
    }

    /// How many times `complete` applied for the interview.
    pub fn completions(&self, interview_id: Uuid) -> usize {
        lock(&self.completions).get(&interview_id).copied().unwrap_or(0)
    }

    /// Run `f` on the interview's status while no completion can apply.
    fn with_status<R>(&self, interview_id: Uuid, f: impl FnOnce(Option<InterviewStatus>) -> R) -> R {
        let interviews = lock(&self.interviews);
        f(interviews.get(&interview_id).map(|i| i.status))
    }
}

#[async_trait]
impl InterviewStore for MemoryInterviewStore {
    async fn create(&self, questions: Vec<String>) -> Result<Interview, InterviewStoreError> {
        if questions.is_empty() {
            return Err(InterviewStoreError::NoQuestions);
        }
        let now = Utc::now();
        let interview = Interview {
            id: Uuid::new_v4(),
            questions: questions.into_iter().map(Question::new).collect(),
            status: InterviewStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };
        lock(&self.interviews).insert(interview.id, interview.clone());
        Ok(interview)
    }

    async fn get(&self, interview_id: Uuid) -> Result<Option<Interview>, InterviewStoreError> {
        Ok(lock(&self.interviews).get(&interview_id).cloned())
    }

    async fn complete(
        &self,
        interview_id: Uuid,
        questions: &[Question],
        event: &CompletionEvent,
    ) -> Result<bool, InterviewStoreError> {
        let mut interviews = lock(&self.interviews);
        let interview = interviews
            .get_mut(&interview_id)
            .ok_or(InterviewStoreError::NotFound(interview_id))?;
        if interview.status != InterviewStatus::Scheduled {
            return Ok(false);
        }
        interview.questions = questions.to_vec();
        interview.status = InterviewStatus::Completed;
        interview.updated_at = Utc::now();
        *lock(&self.completions).entry(interview_id).or_default() += 1;
        lock(&self.outbox)
            .entry(interview_id)
            .or_insert_with(|| (event.clone(), false));
        Ok(true)
    }

    async fn pending_event(&self, interview_id: Uuid) -> Result<Option<CompletionEvent>, InterviewStoreError> {
        Ok(lock(&self.outbox)
            .get(&interview_id)
            .filter(|(_, published)| !published)
            .map(|(event, _)| event.clone()))
    }

    async fn pending_events(&self, older_than: Duration) -> Result<Vec<CompletionEvent>, InterviewStoreError> {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return Ok(Vec::new());
        };
        let cutoff = Utc::now() - age;
        let mut pending: Vec<CompletionEvent> = lock(&self.outbox)
            .values()
            .filter(|(event, published)| !published && event.completed_at <= cutoff)
            .map(|(event, _)| event.clone())
            .collect();
        pending.sort_by_key(|event| event.completed_at);
        Ok(pending)
    }

    async fn mark_published(&self, interview_id: Uuid) -> Result<(), InterviewStoreError> {
        if let Some((_, published)) = lock(&self.outbox).get_mut(&interview_id) {
            *published = true;
        }
        Ok(())
    }
}

type SlotKey = (Uuid, Modality, u32);

/// Submission guard over a map of slots. A guard linked to an interview store
/// only reserves for scheduled interviews; an unlinked one admits any id.
#[derive(Default)]
pub struct MemorySubmissionGuard {
    slots: Mutex<HashMap<SlotKey, Option<String>>>,
    interviews: Option<Arc<MemoryInterviewStore>>,
}

impl MemorySubmissionGuard {
    pub fn linked(interviews: Arc<MemoryInterviewStore>) -> Self {
        MemorySubmissionGuard {
            slots: Mutex::default(),
            interviews: Some(interviews),
        }
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }

    pub fn is_reserved(&self, interview_id: Uuid, modality: Modality, question_index: u32) -> bool {
        lock(&self.slots).contains_key(&(interview_id, modality, question_index))
    }

    /// Seed a recorded slot directly.
    pub fn insert_recorded(&self, interview_id: Uuid, modality: Modality, question_index: u32, url: &str) {
        lock(&self.slots).insert((interview_id, modality, question_index), Some(url.to_string()));
    }
}

#[async_trait]
impl SubmissionGuard for MemorySubmissionGuard {
    async fn try_reserve(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    ) -> Result<ReserveResult, GuardError> {
        let reserve = |status: Option<InterviewStatus>| {
            match status {
                None => return Err(GuardError::UnknownInterview(interview_id)),
                Some(InterviewStatus::Scheduled) => {}
                Some(status) => return Ok(ReserveResult::Closed(status)),
            }
            let mut slots = lock(&self.slots);
            let key = (interview_id, modality, question_index);
            if slots.contains_key(&key) {
                return Ok(ReserveResult::AlreadyExists);
            }
            slots.insert(key, None);
            Ok(ReserveResult::Accepted)
        };

        match &self.interviews {
            Some(interviews) => interviews.with_status(interview_id, reserve),
            None => reserve(Some(InterviewStatus::Scheduled)),
        }
    }

    async fn record(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
        url: &str,
    ) -> Result<RecordResult, GuardError> {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&(interview_id, modality, question_index)) else {
            return Err(GuardError::NotReserved {
                interview_id,
                modality,
                question_index,
            });
        };
        match slot.as_deref() {
            None => {}
            Some(existing) if existing == url => return Ok(RecordResult::Unchanged),
            Some(existing) => {
                return Err(GuardError::Conflict {
                    interview_id,
                    modality,
                    question_index,
                    existing: existing.to_string(),
                    attempted: url.to_string(),
                })
            }
        }
        *slot = Some(url.to_string());
        Ok(RecordResult::Recorded)
    }

    async fn recorded_url(
        &self,
        interview_id: Uuid,
        modality: Modality,
        question_index: u32,
    ) -> Result<Option<String>, GuardError> {
        Ok(lock(&self.slots)
            .get(&(interview_id, modality, question_index))
            .cloned()
            .flatten())
    }

    async fn read_all(&self, interview_id: Uuid, modality: Modality) -> Result<BTreeMap<u32, String>, GuardError> {
        Ok(lock(&self.slots)
            .iter()
            .filter(|((id, m, _), _)| *id == interview_id && *m == modality)
            .filter_map(|((_, _, index), url)| url.clone().map(|url| (*index, url)))
            .collect())
    }

    async fn release(&self, interview_id: Uuid, modality: Modality, question_index: u32) -> Result<bool, GuardError> {
        let mut slots = lock(&self.slots);
        let key = (interview_id, modality, question_index);
        if matches!(slots.get(&key), Some(None)) {
            slots.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn clear(&self, interview_id: Uuid, modality: Modality) -> Result<u64, GuardError> {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|(id, m, _), _| !(*id == interview_id && *m == modality));
        Ok((before - slots.len()) as u64)
    }
}

struct QueueEntry {
    job: Job,
    status: JobStatus,
    seq: u64,
    available_at: Instant,
    lease_expires_at: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<Uuid, QueueEntry>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    /// Total number of jobs ever enqueued and still tracked, in any state.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek(&self, job_id: Uuid) -> Option<Job> {
        lock(&self.state).entries.get(&job_id).map(|e| e.job.clone())
    }

    pub fn last_error(&self, job_id: Uuid) -> Option<String> {
        lock(&self.state).entries.get(&job_id).and_then(|e| e.last_error.clone())
    }

    pub fn count(&self, status: JobStatus) -> usize {
        lock(&self.state).entries.values().filter(|e| e.status == status).count()
    }

    /// Expire the lease of a processing job, as if its worker had died.
    pub fn expire_lease(&self, job_id: Uuid) {
        if let Some(entry) = lock(&self.state).entries.get_mut(&job_id) {
            if entry.status == JobStatus::Processing {
                entry.lease_expires_at = Some(Instant::now() - Duration::from_millis(1));
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: JobRequest, max_attempts: u32) -> Result<Uuid, QueueError> {
        if request.audio.is_none() && request.video.is_none() {
            return Err(QueueError::EmptyJob);
        }
        let mut state = lock(&self.state);
        let id = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            QueueEntry {
                job: Job {
                    id,
                    interview_id: request.interview_id,
                    question_index: request.question_index,
                    audio: request.audio,
                    video: request.video,
                    attempts: 0,
                    max_attempts,
                },
                status: JobStatus::Queued,
                seq,
                available_at: Instant::now(),
                lease_expires_at: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn lease(&self, limit: u32, lease: Duration) -> Result<Vec<Job>, QueueError> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let mut ready: Vec<&mut QueueEntry> = state
            .entries
            .values_mut()
            .filter(|e| e.status == JobStatus::Queued && e.available_at <= now)
            .collect();
        ready.sort_by_key(|e| (e.available_at, e.seq));

        Ok(ready
            .into_iter()
            .take(limit as usize)
            .map(|entry| {
                entry.status = JobStatus::Processing;
                entry.job.attempts += 1;
                entry.lease_expires_at = Some(now + lease);
                entry.job.clone()
            })
            .collect())
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        let entry = state.entries.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        entry.status = JobStatus::Completed;
        entry.lease_expires_at = None;
        entry.last_error = None;
        entry.job.audio = None;
        entry.job.video = None;
        Ok(())
    }

    async fn retry(&self, job_id: Uuid, error: &str, backoff: Duration) -> Result<RetryOutcome, QueueError> {
        let mut state = lock(&self.state);
        let entry = state.entries.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        entry.lease_expires_at = None;
        entry.last_error = Some(error.to_string());
        if entry.job.attempts >= entry.job.max_attempts {
            entry.status = JobStatus::DeadLetter;
            return Ok(RetryOutcome::DeadLettered);
        }
        entry.status = JobStatus::Queued;
        entry.available_at = Instant::now() + backoff;
        Ok(RetryOutcome::Requeued {
            attempts: entry.job.attempts,
        })
    }

    async fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        let entry = state.entries.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        entry.status = JobStatus::DeadLetter;
        entry.lease_expires_at = None;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<ExpiredLeases, QueueError> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let mut expired = ExpiredLeases::default();
        for entry in state.entries.values_mut() {
            let lapsed = entry.status == JobStatus::Processing && entry.lease_expires_at.is_some_and(|t| t < now);
            if !lapsed {
                continue;
            }
            entry.lease_expires_at = None;
            entry.last_error = Some("lease expired".into());
            if entry.job.attempts >= entry.job.max_attempts {
                entry.status = JobStatus::DeadLetter;
                expired.dead_lettered.push(entry.job.job_ref());
            } else {
                entry.status = JobStatus::Queued;
                entry.available_at = now;
                expired.requeued += 1;
            }
        }
        Ok(expired)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        Ok(lock(&self.state).entries.get(&job_id).map(|e| e.status))
    }
}

/// Blob store keeping objects in memory. Can be told to fail the next
/// uploads to exercise retries.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn fail_next_uploads(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Successful uploads so far.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable(format!("injected failure for {key}")));
        }
        lock(&self.objects).insert(key.to_string(), data.to_vec());
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mem://{key}"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryLockClient {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockClient {
    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.locks)
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl LockClient for MemoryLockClient {
    async fn acquire(&self, key: &str, owner: &str, expiry: Duration) -> Result<LockResult, LockError> {
        let now = Instant::now();
        let mut locks = lock(&self.locks);
        if let Some((holder, expires_at)) = locks.get(key) {
            if *expires_at > now {
                return Ok(LockResult::AlreadyHeld(holder.clone()));
            }
        }
        locks.insert(key.to_string(), (owner.to_string(), now + expiry));
        Ok(LockResult::Acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<LockResult, LockError> {
        let mut locks = lock(&self.locks);
        match locks.get(key) {
            Some((holder, _)) if holder == owner => {
                locks.remove(key);
                Ok(LockResult::Released)
            }
            _ => Ok(LockResult::NotFound),
        }
    }
}

#[derive(Default)]
pub struct MemoryEventPublisher {
    events: Mutex<Vec<CompletionEvent>>,
}

impl MemoryEventPublisher {
    pub fn events(&self) -> Vec<CompletionEvent> {
        lock(&self.events).clone()
    }

    pub fn published_for(&self, interview_id: Uuid) -> usize {
        lock(&self.events).iter().filter(|e| e.interview_id == interview_id).count()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), EventError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAlertClient {
    messages: Mutex<Vec<String>>,
}

impl MemoryAlertClient {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl AlertClient for MemoryAlertClient {
    async fn send_message(&self, message_body: String) -> Result<(), AlertError> {
        lock(&self.messages).push(message_body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_reservations_admit_exactly_one() {
        let guard = Arc::new(MemorySubmissionGuard::default());
        let id = Uuid::new_v4();

        let attempts = (0..16).map(|_| {
            let guard = guard.clone();
            tokio::spawn(async move { guard.try_reserve(id, Modality::Audio, 0).await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;
        let accepted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| *r == ReserveResult::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn record_is_idempotent_and_refuses_overwrites() {
        let guard = MemorySubmissionGuard::default();
        let id = Uuid::new_v4();
        guard.try_reserve(id, Modality::Video, 1).await.unwrap();

        assert_eq!(guard.record(id, Modality::Video, 1, "u1").await.unwrap(), RecordResult::Recorded);
        assert_eq!(guard.record(id, Modality::Video, 1, "u1").await.unwrap(), RecordResult::Unchanged);
        let err = guard.record(id, Modality::Video, 1, "u2").await.unwrap_err();
        assert!(matches!(err, GuardError::Conflict { .. }));
        assert_eq!(guard.recorded_url(id, Modality::Video, 1).await.unwrap().as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn read_all_skips_unrecorded_reservations() {
        let guard = MemorySubmissionGuard::default();
        let id = Uuid::new_v4();
        guard.try_reserve(id, Modality::Audio, 0).await.unwrap();
        guard.try_reserve(id, Modality::Audio, 1).await.unwrap();
        guard.record(id, Modality::Audio, 1, "u").await.unwrap();

        let all = guard.read_all(id, Modality::Audio).await.unwrap();
        assert_eq!(all, BTreeMap::from([(1, "u".to_string())]));
        assert!(guard.read_all(id, Modality::Video).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_only_drops_unrecorded_slots() {
        let guard = MemorySubmissionGuard::default();
        let id = Uuid::new_v4();
        guard.try_reserve(id, Modality::Audio, 0).await.unwrap();
        guard.insert_recorded(id, Modality::Video, 0, "u");

        assert!(guard.release(id, Modality::Audio, 0).await.unwrap());
        assert!(!guard.release(id, Modality::Video, 0).await.unwrap());
        assert!(guard.is_reserved(id, Modality::Video, 0));
        assert_eq!(guard.clear(id, Modality::Video).await.unwrap(), 1);
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn record_needs_a_reservation() {
        let guard = MemorySubmissionGuard::default();
        let id = Uuid::new_v4();

        let err = guard.record(id, Modality::Audio, 0, "u").await.unwrap_err();
        assert!(matches!(err, GuardError::NotReserved { question_index: 0, .. }));
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn linked_guard_reserves_only_for_scheduled_interviews() {
        let backend = MemoryBackend::default();
        let id = backend.create_interview(1).await.unwrap().id;

        assert_eq!(
            backend.guard.try_reserve(id, Modality::Audio, 0).await.unwrap(),
            ReserveResult::Accepted
        );
        backend.interviews.set_status(id, InterviewStatus::Completed);
        assert_eq!(
            backend.guard.try_reserve(id, Modality::Video, 0).await.unwrap(),
            ReserveResult::Closed(InterviewStatus::Completed)
        );
        assert!(!backend.guard.is_reserved(id, Modality::Video, 0));

        let missing = Uuid::new_v4();
        let err = backend.guard.try_reserve(missing, Modality::Audio, 0).await.unwrap_err();
        assert!(matches!(err, GuardError::UnknownInterview(got) if got == missing));
    }

    #[tokio::test]
    async fn completion_queues_one_pending_event() {
        let backend = MemoryBackend::default();
        let interview = backend.create_interview(1).await.unwrap();
        let event = CompletionEvent {
            interview_id: interview.id,
            completed_at: Utc::now(),
        };

        assert!(backend.interviews.complete(interview.id, &interview.questions, &event).await.unwrap());
        assert!(!backend.interviews.complete(interview.id, &interview.questions, &event).await.unwrap());
        assert_eq!(backend.interviews.pending_event(interview.id).await.unwrap(), Some(event.clone()));
        assert_eq!(backend.interviews.pending_events(Duration::ZERO).await.unwrap(), vec![event]);
        assert!(backend
            .interviews
            .pending_events(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        backend.interviews.mark_published(interview.id).await.unwrap();
        assert_eq!(backend.interviews.pending_event(interview.id).await.unwrap(), None);
        assert!(backend.interviews.pending_events(Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_jobs_drop_their_payloads() {
        let queue = MemoryJobQueue::default();
        let request = |interview_id| JobRequest {
            interview_id,
            question_index: 0,
            audio: Some(crate::media::fixtures::wav(b"a")),
            video: Some(crate::media::fixtures::webm(b"v")),
        };
        let done = queue.enqueue(request(Uuid::new_v4()), 1).await.unwrap();
        let failed = queue.enqueue(request(Uuid::new_v4()), 1).await.unwrap();
        queue.lease(2, Duration::from_secs(30)).await.unwrap();

        queue.complete(done).await.unwrap();
        queue.dead_letter(failed, "bad payload").await.unwrap();

        let job = queue.peek(done).unwrap();
        assert!(job.audio.is_none() && job.video.is_none());
        // Dead-lettered payloads stay for inspection.
        let job = queue.peek(failed).unwrap();
        assert!(job.audio.is_some() && job.video.is_some());
    }

    #[tokio::test]
    async fn queue_leases_once_and_dead_letters_after_max_attempts() {
        let queue = MemoryJobQueue::default();
        let request = JobRequest {
            interview_id: Uuid::new_v4(),
            question_index: 0,
            audio: Some(crate::media::fixtures::wav(b"")),
            video: None,
        };
        let id = queue.enqueue(request, 2).await.unwrap();

        let leased = queue.lease(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert!(queue.lease(10, Duration::from_secs(30)).await.unwrap().is_empty());

        assert_eq!(
            queue.retry(id, "boom", Duration::ZERO).await.unwrap(),
            RetryOutcome::Requeued { attempts: 1 }
        );
        let leased = queue.lease(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased[0].attempts, 2);
        assert_eq!(queue.retry(id, "boom", Duration::ZERO).await.unwrap(), RetryOutcome::DeadLettered);
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::DeadLetter));
        assert_eq!(queue.last_error(id).as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn expired_leases_are_redelivered() {
        let queue = MemoryJobQueue::default();
        let request = JobRequest {
            interview_id: Uuid::new_v4(),
            question_index: 0,
            audio: None,
            video: Some(crate::media::fixtures::webm(b"")),
        };
        let id = queue.enqueue(request, 3).await.unwrap();
        queue.lease(1, Duration::from_secs(30)).await.unwrap();
        queue.expire_lease(id);

        let expired = queue.requeue_expired().await.unwrap();
        assert_eq!(expired.requeued, 1);
        assert!(expired.dead_lettered.is_empty());
        assert_eq!(queue.lease(1, Duration::from_secs(30)).await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn expired_locks_can_be_taken_over() {
        let locks = MemoryLockClient::default();
        assert_eq!(locks.acquire("k", "a", Duration::ZERO).await.unwrap(), LockResult::Acquired);
        assert_eq!(locks.acquire("k", "b", Duration::from_secs(60)).await.unwrap(), LockResult::Acquired);
        assert_eq!(
            locks.acquire("k", "c", Duration::from_secs(60)).await.unwrap(),
            LockResult::AlreadyHeld("b".into())
        );
        assert_eq!(locks.release("k", "a").await.unwrap(), LockResult::NotFound);
        assert_eq!(locks.release("k", "b").await.unwrap(), LockResult::Released);
    }
}
