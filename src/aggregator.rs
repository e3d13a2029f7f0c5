use std::collections::BTreeMap;

use clap::ValueEnum;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::FinalizeError;
use crate::finalizer::{self, FinalizeOutcome};
use crate::{Modality, Pipeline};

/// When an interview counts as fully answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CompletionPolicy {
    /// Every question has both an audio and a video recording.
    #[default]
    Both,
    /// Every question has at least one recording of either kind.
    Either,
}

impl CompletionPolicy {
    pub fn is_complete(&self, expected: usize, audio: &BTreeMap<u32, String>, video: &BTreeMap<u32, String>) -> bool {
        match self {
            CompletionPolicy::Both => audio.len() == expected && video.len() == expected,
            CompletionPolicy::Either => (0..expected as u32).all(|i| audio.contains_key(&i) || video.contains_key(&i)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Collecting { expected: usize, audio: usize, video: usize },
    Complete(FinalizeOutcome),
}

/// Check whether all expected media has arrived and, if so, hand the
/// interview to the finalizer. Safe to call concurrently.
#[instrument(skip(pipeline))]
pub async fn evaluate(pipeline: &Pipeline, interview_id: Uuid) -> Result<Completion, FinalizeError> {
    let interview = pipeline
        .interviews
        .get(interview_id)
        .await?
        .ok_or(FinalizeError::InterviewMissing(interview_id))?;
    let expected = interview.question_count();

    let audio = pipeline.guard.read_all(interview_id, Modality::Audio).await?;
    let video = pipeline.guard.read_all(interview_id, Modality::Video).await?;

    if !pipeline.settings.completion_policy.is_complete(expected, &audio, &video) {
        debug!(message = "Still collecting", expected, audio = audio.len(), video = video.len());
        return Ok(Completion::Collecting {
            expected,
            audio: audio.len(),
            video: video.len(),
        });
    }

    let outcome = finalizer::finalize(pipeline, interview_id).await?;
    Ok(Completion::Complete(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn urls(indices: &[u32]) -> BTreeMap<u32, String> {
        indices.iter().map(|i| (*i, format!("url-{i}"))).collect()
    }

    #[rstest]
    #[case(CompletionPolicy::Both, &[0, 1, 2], &[0, 1, 2], true)]
    #[case(CompletionPolicy::Both, &[0, 1, 2], &[0, 2], false)]
    #[case(CompletionPolicy::Both, &[], &[0, 1, 2], false)]
    #[case(CompletionPolicy::Either, &[0, 1], &[2], true)]
    #[case(CompletionPolicy::Either, &[0], &[0], false)]
    #[case(CompletionPolicy::Either, &[0, 1, 2], &[], true)]
    fn completion_predicate(
        #[case] policy: CompletionPolicy,
        #[case] audio: &[u32],
        #[case] video: &[u32],
        #[case] complete: bool,
    ) {
        assert_eq!(policy.is_complete(3, &urls(audio), &urls(video)), complete);
    }
}
