//! Durable background work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Work handed off from the request path to the background worker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Quick transcription of a batch of chunks for live monitoring.
    PreliminaryTranscription {
        session_id: String,
        chunk_indices: Vec<u32>,
    },
    /// Full transcription and analysis of a finalized recording.
    FinalizeRecording { session_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::PreliminaryTranscription { .. } => "preliminary_transcription",
            Job::FinalizeRecording { .. } => "finalize_recording",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Job::PreliminaryTranscription { session_id, .. }
            | Job::FinalizeRecording { session_id } => session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// A row of the `jobs` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: String,
    /// JSON-encoded [`Job`].
    pub payload: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Earliest time the job may be claimed; for running jobs, lease expiry.
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn job(&self) -> serde_json::Result<Job> {
        serde_json::from_str(&self.payload)
    }
}
