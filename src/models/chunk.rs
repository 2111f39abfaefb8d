//! One sequentially-numbered audio segment of a recording.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Where a chunk stands with respect to preliminary transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionState {
    /// Not yet part of any batch.
    Pending,
    /// Handed to a preliminary transcription job.
    Queued,
    Done,
}

/// Which transcription produced `transcript_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Preliminary,
    Final,
}

/// Metadata for a persisted chunk. The audio bytes live in the object store
/// under `storage_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Chunk {
    pub session_id: String,

    /// 0-based position in the recording.
    pub chunk_index: i64,

    /// Offset from recording start.
    pub start_time_seconds: i64,
    pub duration_seconds: i64,

    pub size_bytes: i64,
    pub storage_key: String,

    pub transcription_state: TranscriptionState,
    pub transcript_text: Option<String>,
    pub transcript_source: Option<TranscriptSource>,
    pub confidence: Option<f64>,
    pub transcribed_at: Option<DateTime<Utc>>,

    pub received_at: DateTime<Utc>,
}

impl Chunk {
    pub fn index(&self) -> u32 {
        self.chunk_index as u32
    }

    pub fn size(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }

    /// `m:ss` offset of this chunk within the recording.
    pub fn time_display(&self) -> String {
        format!(
            "{}:{:02}",
            self.start_time_seconds / 60,
            self.start_time_seconds % 60
        )
    }
}

/// Fields supplied by the ingest endpoint when a chunk is first persisted.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub index: u32,
    pub start_time_seconds: i64,
    pub duration_seconds: i64,
    pub size_bytes: u64,
    pub storage_key: String,
}
