//! src/services/ingest.rs
//!
//! Accepts one chunk per call and advances its upload session.
//!
//! Each chunk is stored as its own object and immediately appended to the
//! session's optimistic multipart upload with a server-side copy. All
//! bookkeeping for a session happens under that session's lock.

use crate::{
    config::IngestSettings,
    errors::{IngestError, IngestResult},
    models::{
        chunk::{NewChunk, TranscriptionState},
        job::Job,
        multipart::{MAX_CHUNK_INDEX, MultipartPart},
        session::{SessionState, UploadSession},
    },
    services::{
        jobs::JobQueue,
        reassembly::{Reassembled, ReassemblyOrchestrator},
        session_store::{SessionLocks, SessionStore},
    },
    storage::{self, ObjectStore, StorageError},
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MAX_SESSION_ID_LEN: usize = 100;

/// One chunk delivery as received from the client.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub session_id: String,
    pub index: u32,
    pub start_time_seconds: i64,
    pub duration_seconds: i64,
    pub is_final: bool,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub accepted: bool,
    pub total_received: usize,
    pub complete: bool,
}

/// Session ids are client-chosen; keep them safe to embed in object keys.
pub fn validate_session_id(id: &str) -> IngestResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IngestError::BadRequest(format!(
            "session id must be 1-{} characters of [A-Za-z0-9_-]",
            MAX_SESSION_ID_LEN
        )))
    }
}

#[derive(Clone)]
pub struct IngestService {
    sessions: SessionStore,
    locks: SessionLocks,
    store: Arc<dyn ObjectStore>,
    reassembly: ReassemblyOrchestrator,
    jobs: JobQueue,
    settings: IngestSettings,
}

impl IngestService {
    pub fn new(
        sessions: SessionStore,
        locks: SessionLocks,
        store: Arc<dyn ObjectStore>,
        jobs: JobQueue,
        settings: IngestSettings,
    ) -> Self {
        let reassembly = ReassemblyOrchestrator::new(
            sessions.clone(),
            store.clone(),
            jobs.clone(),
            settings.clone(),
        );
        Self {
            sessions,
            locks,
            store,
            reassembly,
            jobs,
            settings,
        }
    }

    pub async fn ingest(&self, owner: &str, upload: ChunkUpload) -> IngestResult<IngestReceipt> {
        validate_session_id(&upload.session_id)?;
        if upload.body.is_empty() {
            return Err(IngestError::BadRequest("chunk body is empty".into()));
        }

        let session_id = upload.session_id.as_str();
        let index = upload.index;
        let Some(part_number) = MultipartPart::number_for_chunk(index) else {
            return Err(IngestError::BadRequest(format!(
                "chunk index {} exceeds the maximum of {}",
                index, MAX_CHUNK_INDEX
            )));
        };
        let _guard = self.locks.acquire(session_id).await;

        let mut session = match self.sessions.get(session_id).await? {
            Some(session) if session.owner != owner => {
                return Err(IngestError::Unauthorized(session_id.to_string()));
            }
            Some(session) => session,
            None if index != 0 => {
                return Err(IngestError::SequenceError {
                    session_id: session_id.to_string(),
                    index,
                    reason: "chunk 0 has not been received".into(),
                });
            }
            None => {
                info!(session_id, owner, "opening upload session");
                self.sessions.create(session_id, owner).await?
            }
        };

        if session.state == SessionState::Aborted {
            return Err(IngestError::SessionAborted(session_id.to_string()));
        }

        if session.received_chunks.contains(&index) {
            debug!(session_id, chunk_index = index, "duplicate chunk delivery");
            let complete = if upload.is_final && !session.final_uploaded {
                self.reassembly.finalize(session_id, None).await?;
                true
            } else {
                session.final_uploaded
            };
            return Ok(IngestReceipt {
                accepted: true,
                total_received: session.received_chunks.len(),
                complete,
            });
        }

        if session.final_uploaded {
            return Err(IngestError::SequenceError {
                session_id: session_id.to_string(),
                index,
                reason: "session is already finalized".into(),
            });
        }

        if index == 0 && session.multipart_upload_id.is_none() && session.state == SessionState::Empty
        {
            self.open_multipart(&mut session).await?;
        }

        let (Some(upload_id), Some(multipart_key)) =
            (session.multipart_upload_id.clone(), session.multipart_key.clone())
        else {
            return Err(IngestError::SequenceError {
                session_id: session_id.to_string(),
                index,
                reason: "no multipart upload is open; send chunk 0 first".into(),
            });
        };

        let chunk_key = storage::chunk_key(&session.owner, session_id, index);
        let etag = match self
            .store_chunk(&chunk_key, upload.body.clone(), &multipart_key, &upload_id, part_number)
            .await
        {
            Ok(etag) => etag,
            Err(err) => {
                error!(
                    session_id,
                    chunk_index = index,
                    upload_id = %upload_id,
                    error = %err,
                    "chunk upload failed, aborting session"
                );
                self.abort_session(&session, &multipart_key, &upload_id, &chunk_key)
                    .await;
                return Err(IngestError::UploadFailed(err.to_string()));
            }
        };

        let chunk = NewChunk {
            index,
            start_time_seconds: upload.start_time_seconds,
            duration_seconds: upload.duration_seconds,
            size_bytes: upload.body.len() as u64,
            storage_key: chunk_key,
        };
        let part = MultipartPart::new(part_number as i64, etag);
        self.sessions.commit_chunk(&session, &chunk, &part).await?;
        let total_received = session.received_chunks.len() + 1;

        info!(
            session_id,
            chunk_index = index,
            part_number,
            size_bytes = chunk.size_bytes,
            total_received,
            is_final = upload.is_final,
            "chunk accepted"
        );

        if upload.is_final {
            self.reassembly.finalize(session_id, None).await?;
            return Ok(IngestReceipt {
                accepted: true,
                total_received,
                complete: true,
            });
        }

        self.dispatch_preliminary(session_id).await;
        Ok(IngestReceipt {
            accepted: true,
            total_received,
            complete: false,
        })
    }

    /// Explicit finalization, e.g. after the missing chunk of an earlier
    /// `IncompleteSequence` has arrived.
    pub async fn finalize(
        &self,
        owner: &str,
        session_id: &str,
        title: Option<&str>,
    ) -> IngestResult<Reassembled> {
        let _guard = self.locks.acquire(session_id).await;
        self.owned(owner, session_id).await?;
        self.reassembly.finalize(session_id, title).await
    }

    /// Queue the transcription/analysis hand-off again for a finalized session.
    pub async fn retry_analysis(&self, owner: &str, session_id: &str) -> IngestResult<()> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.owned(owner, session_id).await?;
        if !session.final_uploaded {
            return Err(IngestError::BadRequest(format!(
                "session `{}` is not finalized",
                session_id
            )));
        }
        self.jobs
            .enqueue(&Job::FinalizeRecording {
                session_id: session_id.to_string(),
            })
            .await?;
        info!(session_id, "re-queued transcription and analysis");
        Ok(())
    }

    /// Load a session, requiring it to belong to `owner`.
    pub async fn owned(&self, owner: &str, session_id: &str) -> IngestResult<UploadSession> {
        let session = self.sessions.require(session_id).await?;
        if session.owner != owner {
            return Err(IngestError::Unauthorized(session_id.to_string()));
        }
        Ok(session)
    }

    async fn open_multipart(&self, session: &mut UploadSession) -> IngestResult<()> {
        let key = storage::final_key(&session.owner, &session.id);
        let upload_id = self
            .store
            .create_multipart_upload(&key)
            .await
            .map_err(|e| IngestError::UploadFailed(e.to_string()))?;

        session
            .transition(SessionState::Opening)
            .map_err(|e| IngestError::UploadFailed(e.to_string()))?;
        self.sessions
            .set_multipart(&session.id, &upload_id, &key, SessionState::Opening)
            .await?;
        debug!(session_id = %session.id, upload_id = %upload_id, "opened optimistic multipart upload");

        session.multipart_upload_id = Some(upload_id);
        session.multipart_key = Some(key);
        Ok(())
    }

    async fn store_chunk(
        &self,
        chunk_key: &str,
        body: Bytes,
        multipart_key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<String, StorageError> {
        self.store.put_object(chunk_key, body).await?;
        self.store
            .upload_part_copy(multipart_key, upload_id, part_number, chunk_key)
            .await
    }

    /// Release the session's storage state after an unrecoverable failure.
    async fn abort_session(
        &self,
        session: &UploadSession,
        multipart_key: &str,
        upload_id: &str,
        chunk_key: &str,
    ) {
        if let Err(err) = self
            .store
            .abort_multipart_upload(multipart_key, upload_id)
            .await
        {
            warn!(session_id = %session.id, upload_id, error = %err, "abort multipart upload failed");
        }
        if let Err(err) = self.store.delete_objects(&[chunk_key.to_string()]).await {
            warn!(session_id = %session.id, chunk_key, error = %err, "could not delete chunk object");
        }
        if let Err(err) = self
            .sessions
            .clear_multipart(&session.id, SessionState::Aborted)
            .await
        {
            error!(session_id = %session.id, error = %err, "could not mark session aborted");
        }
    }

    /// Queue a preliminary transcription batch once enough chunks are waiting.
    async fn dispatch_preliminary(&self, session_id: &str) {
        if let Err(err) = self.queue_preliminary(session_id).await {
            warn!(session_id, error = %err, "could not queue preliminary transcription");
        }
    }

    async fn queue_preliminary(&self, session_id: &str) -> IngestResult<()> {
        let pending = self.sessions.pending_transcription(session_id).await?;
        if pending.is_empty() || pending.len() < self.settings.transcription_batch_size {
            return Ok(());
        }
        self.sessions
            .set_transcription_state(session_id, &pending, TranscriptionState::Queued)
            .await?;
        self.jobs
            .enqueue(&Job::PreliminaryTranscription {
                session_id: session_id.to_string(),
                chunk_indices: pending.clone(),
            })
            .await?;
        debug!(session_id, chunks = ?pending, "queued preliminary transcription");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_restricted() {
        assert!(validate_session_id("rec_2024-01-01").is_ok());
        assert!(validate_session_id("6f1c0a2e-1d3b-4a8e-9f0e-2b7c5d1e9a10").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id(&"a".repeat(101)).is_err());
    }
}
