//! src/services/session_store.rs
//!
//! Durable state of upload sessions and their chunks, backed by SQLite.
//!
//! Every mutation of a session's bookkeeping happens while the caller holds
//! that session's guard from [`SessionLocks`], and the per-chunk commit
//! (chunk row, part row, duration, state) runs in a single transaction, so
//! concurrent deliveries for one session cannot drop each other's updates.

use crate::{
    errors::{IngestError, IngestResult},
    models::{
        chunk::{Chunk, NewChunk, TranscriptSource, TranscriptionState},
        multipart::MultipartPart,
        session::{SessionState, UploadSession},
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::sync::{Mutex, OwnedMutexGuard};

const SESSION_COLUMNS: &str = "id, owner, state, multipart_upload_id, multipart_key, \
     chunks_complete, final_uploaded, total_duration_seconds, final_object_key, \
     final_size_bytes, title, full_transcript, transcript_confidence, speaker_turns, \
     insights, analyzed, transcription_error, analysis_error, started_at, ended_at, updated_at";

const CHUNK_COLUMNS: &str = "session_id, chunk_index, start_time_seconds, duration_seconds, \
     size_bytes, storage_key, transcription_state, transcript_text, transcript_source, \
     confidence, transcribed_at, received_at";

/// Per-session mutual exclusion.
///
/// Entries are created on demand and removed when the last guard for a
/// session is released, so the map only holds sessions with callers in flight.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Holds one session's lock until dropped.
pub struct SessionGuard {
    session_id: String,
    locks: SessionLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            session_id: session_id.to_string(),
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    /// Number of sessions currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = map.get(&self.session_id) {
            // Only the map itself still references the lock.
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.session_id);
            }
        }
    }
}

/// Chunk and session persistence.
#[derive(Clone)]
pub struct SessionStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Fetch a session with its received chunk indices and parts loaded.
    pub async fn get(&self, session_id: &str) -> IngestResult<Option<UploadSession>> {
        let row = sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?;

        let Some(mut session) = row else {
            return Ok(None);
        };

        let indices: Vec<i64> = sqlx::query_scalar(
            "SELECT chunk_index FROM chunks WHERE session_id = ? ORDER BY chunk_index",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        session.received_chunks = indices.into_iter().map(|i| i as u32).collect();

        session.parts = sqlx::query_as::<_, MultipartPart>(
            "SELECT part_number, etag FROM session_parts WHERE session_id = ? ORDER BY part_number",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(Some(session))
    }

    /// Like [`get`](Self::get) but a missing session is an error.
    pub async fn require(&self, session_id: &str) -> IngestResult<UploadSession> {
        self.get(session_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))
    }

    /// Insert a new, empty session.
    pub async fn create(&self, session_id: &str, owner: &str) -> IngestResult<UploadSession> {
        let session = UploadSession::new(session_id, owner);
        sqlx::query(
            "INSERT INTO upload_sessions (id, owner, state, started_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.owner)
        .bind(session.state)
        .bind(session.started_at)
        .bind(session.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(session)
    }

    pub async fn set_state(&self, session_id: &str, state: SessionState) -> IngestResult<()> {
        sqlx::query("UPDATE upload_sessions SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Attach an opened multipart upload to the session.
    pub async fn set_multipart(
        &self,
        session_id: &str,
        upload_id: &str,
        key: &str,
        state: SessionState,
    ) -> IngestResult<()> {
        sqlx::query(
            "UPDATE upload_sessions
             SET multipart_upload_id = ?, multipart_key = ?, state = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(upload_id)
        .bind(key)
        .bind(state)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Detach the multipart upload and forget its parts, moving to `state`.
    pub async fn clear_multipart(&self, session_id: &str, state: SessionState) -> IngestResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM session_parts WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE upload_sessions
             SET multipart_upload_id = NULL, multipart_key = NULL, state = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(state)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a persisted chunk, its multipart part and the advanced
    /// duration atomically. Returns `false` if the index was already present.
    pub async fn commit_chunk(
        &self,
        session: &UploadSession,
        chunk: &NewChunk,
        part: &MultipartPart,
    ) -> IngestResult<bool> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO chunks (
                session_id, chunk_index, start_time_seconds, duration_seconds,
                size_bytes, storage_key, transcription_state, received_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, chunk_index) DO NOTHING",
        )
        .bind(&session.id)
        .bind(chunk.index as i64)
        .bind(chunk.start_time_seconds)
        .bind(chunk.duration_seconds)
        .bind(chunk.size_bytes as i64)
        .bind(&chunk.storage_key)
        .bind(TranscriptionState::Pending)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO session_parts (session_id, part_number, etag) VALUES (?, ?, ?)
             ON CONFLICT(session_id, part_number) DO UPDATE SET etag = excluded.etag",
        )
        .bind(&session.id)
        .bind(part.part_number)
        .bind(&part.etag)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE upload_sessions
             SET total_duration_seconds = MAX(total_duration_seconds, ?), state = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(chunk.start_time_seconds + chunk.duration_seconds)
        .bind(SessionState::Accumulating)
        .bind(now)
        .bind(&session.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// All chunks of a session in index order.
    pub async fn list_chunks(&self, session_id: &str) -> IngestResult<Vec<Chunk>> {
        let chunks = sqlx::query_as::<_, Chunk>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE session_id = ? ORDER BY chunk_index"
        ))
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    pub async fn get_chunk(&self, session_id: &str, index: u32) -> IngestResult<Option<Chunk>> {
        let chunk = sqlx::query_as::<_, Chunk>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE session_id = ? AND chunk_index = ?"
        ))
        .bind(session_id)
        .bind(index as i64)
        .fetch_optional(&*self.db)
        .await?;
        Ok(chunk)
    }

    /// Mark the session finalized with its reassembled object.
    pub async fn mark_finalized(
        &self,
        session_id: &str,
        final_key: &str,
        final_size_bytes: u64,
        title: &str,
    ) -> IngestResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE upload_sessions
             SET state = ?, final_object_key = ?, final_size_bytes = ?, title = ?,
                 final_uploaded = 1, chunks_complete = 1,
                 multipart_upload_id = NULL, multipart_key = NULL,
                 ended_at = ?, updated_at = ?
             WHERE id = ? AND final_uploaded = 0",
        )
        .bind(SessionState::Finalized)
        .bind(final_key)
        .bind(final_size_bytes as i64)
        .bind(title)
        .bind(now)
        .bind(now)
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Chunk indices not yet handed to a preliminary transcription batch.
    pub async fn pending_transcription(&self, session_id: &str) -> IngestResult<Vec<u32>> {
        let indices: Vec<i64> = sqlx::query_scalar(
            "SELECT chunk_index FROM chunks
             WHERE session_id = ? AND transcription_state = ?
             ORDER BY chunk_index",
        )
        .bind(session_id)
        .bind(TranscriptionState::Pending)
        .fetch_all(&*self.db)
        .await?;
        Ok(indices.into_iter().map(|i| i as u32).collect())
    }

    pub async fn set_transcription_state(
        &self,
        session_id: &str,
        indices: &[u32],
        state: TranscriptionState,
    ) -> IngestResult<()> {
        let mut tx = self.db.begin().await?;
        for index in indices {
            sqlx::query(
                "UPDATE chunks SET transcription_state = ? WHERE session_id = ? AND chunk_index = ?",
            )
            .bind(state)
            .bind(session_id)
            .bind(*index as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_chunk_transcript(
        &self,
        session_id: &str,
        index: u32,
        text: &str,
        source: TranscriptSource,
        confidence: Option<f64>,
    ) -> IngestResult<()> {
        sqlx::query(
            "UPDATE chunks
             SET transcript_text = ?, transcript_source = ?, confidence = ?,
                 transcription_state = ?, transcribed_at = ?
             WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(text)
        .bind(source)
        .bind(confidence)
        .bind(TranscriptionState::Done)
        .bind(Utc::now())
        .bind(session_id)
        .bind(index as i64)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Store the final transcript and clear any previous transcription error.
    pub async fn record_transcript(
        &self,
        session_id: &str,
        text: &str,
        confidence: Option<f64>,
        speaker_turns_json: &str,
    ) -> IngestResult<()> {
        sqlx::query(
            "UPDATE upload_sessions
             SET full_transcript = ?, transcript_confidence = ?, speaker_turns = ?,
                 transcription_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(text)
        .bind(confidence)
        .bind(speaker_turns_json)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Store analysis insights and clear any previous analysis error.
    pub async fn record_insights(&self, session_id: &str, insights_json: &str) -> IngestResult<()> {
        sqlx::query(
            "UPDATE upload_sessions
             SET insights = ?, analyzed = 1, analysis_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(insights_json)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn record_transcription_error(&self, session_id: &str, error: &str) -> IngestResult<()> {
        sqlx::query(
            "UPDATE upload_sessions SET transcription_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn record_analysis_error(&self, session_id: &str, error: &str) -> IngestResult<()> {
        sqlx::query("UPDATE upload_sessions SET analysis_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}
