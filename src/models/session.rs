//! Server-side record of one recording's chunk reassembly.

use super::multipart::MultipartPart;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle of an upload session.
///
/// ```text
/// Empty -> Opening -> Accumulating -> Finalizing -> Finalized
///             \            \   ^           |
///              \            \   `----------'  (reassembly failed, retry allowed)
///               `------------`--> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Row exists, no multipart upload yet.
    Empty,
    /// Optimistic multipart upload opened, chunk 0 not yet committed.
    Opening,
    /// At least one chunk committed.
    Accumulating,
    /// Reassembly in progress.
    Finalizing,
    /// Final object written; terminal.
    Finalized,
    /// Unrecoverable storage failure; terminal, client must start over.
    Aborted,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Empty, Opening)
                | (Opening, Accumulating)
                | (Accumulating, Accumulating)
                | (Accumulating, Finalizing)
                | (Finalizing, Finalized)
                | (Finalizing, Accumulating)
                | (Opening, Aborted)
                | (Accumulating, Aborted)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Empty => "empty",
            SessionState::Opening => "opening",
            SessionState::Accumulating => "accumulating",
            SessionState::Finalizing => "finalizing",
            SessionState::Finalized => "finalized",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Returned when a caller asks for a transition the state machine forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session transition {} -> {}", self.from, self.to)
    }
}

/// One recording's reassembly state.
///
/// `received_chunks` and `parts` are not columns; they are loaded from the
/// `chunks` and `session_parts` tables by the session store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Client-supplied recording identifier.
    pub id: String,

    /// Identity of the recording user.
    pub owner: String,

    pub state: SessionState,

    /// Handle of the optimistic multipart upload opened at chunk 0.
    pub multipart_upload_id: Option<String>,
    pub multipart_key: Option<String>,

    /// Monotonic: never reset once true.
    pub chunks_complete: bool,
    /// Monotonic: set only by the reassembly orchestrator.
    pub final_uploaded: bool,

    /// High-water mark of `start_time + duration` across chunks.
    pub total_duration_seconds: i64,

    pub final_object_key: Option<String>,
    pub final_size_bytes: Option<i64>,
    pub title: Option<String>,

    pub full_transcript: Option<String>,
    pub transcript_confidence: Option<f64>,
    /// JSON-encoded speaker turns from the final transcription.
    pub speaker_turns: Option<String>,
    /// JSON-encoded analysis insights.
    pub insights: Option<String>,
    pub analyzed: bool,
    pub transcription_error: Option<String>,
    pub analysis_error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    #[sqlx(skip)]
    pub received_chunks: BTreeSet<u32>,

    #[sqlx(skip)]
    pub parts: Vec<MultipartPart>,
}

impl UploadSession {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner: owner.into(),
            state: SessionState::Empty,
            multipart_upload_id: None,
            multipart_key: None,
            chunks_complete: false,
            final_uploaded: false,
            total_duration_seconds: 0,
            final_object_key: None,
            final_size_bytes: None,
            title: None,
            full_transcript: None,
            transcript_confidence: None,
            speaker_turns: None,
            insights: None,
            analyzed: false,
            transcription_error: None,
            analysis_error: None,
            started_at: now,
            ended_at: None,
            updated_at: now,
            received_chunks: BTreeSet::new(),
            parts: Vec::new(),
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Indices in `0..=max` that have not been received, where `max` is the
    /// highest received index. Ingest bounds indices, so `max` stays small.
    pub fn missing_chunks(&self) -> Vec<u32> {
        let Some(max) = self.received_chunks.iter().next_back().copied() else {
            return vec![0];
        };
        (0..=max)
            .filter(|index| !self.received_chunks.contains(index))
            .collect()
    }

    /// Human-readable duration, e.g. `"3m 07s"`.
    pub fn duration_display(&self) -> String {
        let minutes = self.total_duration_seconds / 60;
        let seconds = self.total_duration_seconds % 60;
        format!("{}m {:02}s", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_allowed_edges() {
        let mut session = UploadSession::new("rec-1", "alice");
        session.transition(SessionState::Opening).unwrap();
        session.transition(SessionState::Accumulating).unwrap();
        session.transition(SessionState::Finalizing).unwrap();
        session.transition(SessionState::Finalized).unwrap();
        assert_eq!(session.state, SessionState::Finalized);

        let err = session.transition(SessionState::Accumulating).unwrap_err();
        assert_eq!(err.from, SessionState::Finalized);
    }

    #[test]
    fn aborted_is_reachable_only_before_finalizing() {
        assert!(SessionState::Opening.can_transition_to(SessionState::Aborted));
        assert!(SessionState::Accumulating.can_transition_to(SessionState::Aborted));
        assert!(!SessionState::Finalizing.can_transition_to(SessionState::Aborted));
        assert!(!SessionState::Finalized.can_transition_to(SessionState::Aborted));
        assert!(!SessionState::Aborted.can_transition_to(SessionState::Opening));
    }

    #[test]
    fn missing_chunks_reports_gaps() {
        let mut session = UploadSession::new("rec-1", "alice");
        session.received_chunks.extend([0, 1, 3, 5]);
        assert_eq!(session.missing_chunks(), vec![2, 4]);

        session.received_chunks.insert(2);
        session.received_chunks.insert(4);
        assert!(session.missing_chunks().is_empty());
    }

    #[test]
    fn duration_displays_minutes_and_seconds() {
        let mut session = UploadSession::new("rec-1", "alice");
        session.total_duration_seconds = 180;
        assert_eq!(session.duration_display(), "3m 00s");
        session.total_duration_seconds = 67;
        assert_eq!(session.duration_display(), "1m 07s");
    }
}
