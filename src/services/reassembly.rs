//! src/services/reassembly.rs
//!
//! Turns a session's chunk objects into one contiguous recording.
//!
//! Small recordings are concatenated in memory and written with a single
//! PUT. Recordings at or above the configured threshold are rebuilt as a
//! fresh multipart upload whose parts are server-side copies of the chunk
//! objects, except where adjacent small chunks have to be merged to reach
//! the backend's minimum part size.

use crate::{
    config::IngestSettings,
    errors::{IngestError, IngestResult},
    models::{chunk::Chunk, job::Job, session::SessionState},
    services::{jobs::JobQueue, session_store::SessionStore},
    storage::{self, CompletedPart, ObjectStore, StorageError},
};
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How the final object is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Concatenate,
    Multipart,
}

/// Pick a strategy for `chunk_count` chunks totalling `total_bytes`.
///
/// The threshold is inclusive on the multipart side. A single chunk is
/// always concatenated.
pub fn select_strategy(total_bytes: u64, chunk_count: usize, threshold: u64) -> Strategy {
    if chunk_count <= 1 || total_bytes < threshold {
        Strategy::Concatenate
    } else {
        Strategy::Multipart
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub size: u64,
}

impl From<&Chunk> for ChunkSpan {
    fn from(chunk: &Chunk) -> Self {
        Self {
            index: chunk.index(),
            size: chunk.size(),
        }
    }
}

/// One part of the retroactive multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub part_number: i32,
    /// Chunk indices contributing to this part, in order.
    pub chunks: Vec<u32>,
    pub size: u64,
}

impl PartPlan {
    /// A single-chunk part is a pure server-side copy.
    pub fn is_copy(&self) -> bool {
        self.chunks.len() == 1
    }
}

/// Group chunks, in index order, into parts of at least `min_part_size`
/// bytes. Only the last part may be smaller.
pub fn plan_parts(spans: &[ChunkSpan], min_part_size: u64) -> Vec<PartPlan> {
    let mut ordered = spans.to_vec();
    ordered.sort_by_key(|span| span.index);

    let mut plans = Vec::new();
    let mut batch = Vec::new();
    let mut batch_size = 0u64;
    let last = ordered.len().saturating_sub(1);

    for (pos, span) in ordered.iter().enumerate() {
        batch.push(span.index);
        batch_size += span.size;
        if batch_size >= min_part_size || pos == last {
            plans.push(PartPlan {
                part_number: plans.len() as i32 + 1,
                chunks: std::mem::take(&mut batch),
                size: batch_size,
            });
            batch_size = 0;
        }
    }
    plans
}

/// Result of a finalization call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub final_key: String,
    pub size_bytes: u64,
    /// `None` when the session was already finalized and nothing ran.
    pub strategy: Option<Strategy>,
}

#[derive(Clone)]
pub struct ReassemblyOrchestrator {
    sessions: SessionStore,
    store: Arc<dyn ObjectStore>,
    jobs: JobQueue,
    settings: IngestSettings,
}

impl ReassemblyOrchestrator {
    pub fn new(
        sessions: SessionStore,
        store: Arc<dyn ObjectStore>,
        jobs: JobQueue,
        settings: IngestSettings,
    ) -> Self {
        Self {
            sessions,
            store,
            jobs,
            settings,
        }
    }

    /// Produce the final object for `session_id` and mark it finalized.
    ///
    /// The caller must hold the session's lock.
    pub async fn finalize(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> IngestResult<Reassembled> {
        let mut session = self.sessions.require(session_id).await?;

        if session.final_uploaded {
            let final_key = session
                .final_object_key
                .clone()
                .unwrap_or_else(|| storage::final_key(&session.owner, &session.id));
            debug!(session_id, final_key = %final_key, "session already finalized");
            return Ok(Reassembled {
                final_key,
                size_bytes: session.final_size_bytes.unwrap_or(0).max(0) as u64,
                strategy: None,
            });
        }
        if session.state == SessionState::Aborted {
            return Err(IngestError::SessionAborted(session_id.to_string()));
        }

        let missing = session.missing_chunks();
        if !missing.is_empty() {
            warn!(session_id, ?missing, "refusing to finalize incomplete session");
            return Err(IngestError::IncompleteSequence {
                session_id: session_id.to_string(),
                missing,
            });
        }

        if session.state != SessionState::Finalizing {
            session
                .transition(SessionState::Finalizing)
                .map_err(|e| IngestError::ReassemblyFailed(e.to_string()))?;
        }

        // The optimistic upload's parts are chunk-sized and usually below
        // the minimum part size, so it is never completed.
        if let (Some(upload_id), Some(key)) = (&session.multipart_upload_id, &session.multipart_key)
        {
            match self.store.abort_multipart_upload(key, upload_id).await {
                Ok(()) => debug!(session_id, upload_id = %upload_id, "aborted optimistic upload"),
                Err(StorageError::NoSuchUpload(_)) => {}
                Err(err) => warn!(
                    session_id,
                    upload_id = %upload_id,
                    error = %err,
                    "could not abort optimistic upload"
                ),
            }
        }
        self.sessions
            .clear_multipart(session_id, SessionState::Finalizing)
            .await?;

        let chunks = self.sessions.list_chunks(session_id).await?;
        let total_bytes: u64 = chunks.iter().map(Chunk::size).sum();
        let strategy = select_strategy(
            total_bytes,
            chunks.len(),
            self.settings.concat_threshold_bytes,
        );
        let final_key = storage::final_key(&session.owner, &session.id);

        info!(
            session_id,
            chunks = chunks.len(),
            total_bytes,
            ?strategy,
            "reassembling recording"
        );

        let outcome = match strategy {
            Strategy::Concatenate => self.concatenate(&chunks, &final_key).await,
            Strategy::Multipart => self.multipart(session_id, &chunks, &final_key).await,
        };
        if let Err(err) = outcome {
            error!(session_id, error = %err, "reassembly failed");
            self.sessions
                .set_state(session_id, SessionState::Accumulating)
                .await?;
            return Err(IngestError::ReassemblyFailed(err.to_string()));
        }

        let size_bytes = match self.store.head_object(&final_key).await {
            Ok(size) => size,
            Err(err) => {
                warn!(session_id, error = %err, "head of final object failed");
                total_bytes
            }
        };

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Recording - {}", session.duration_display()));

        self.sessions
            .mark_finalized(session_id, &final_key, size_bytes, &title)
            .await?;
        info!(session_id, final_key = %final_key, size_bytes, "session finalized");

        let job = Job::FinalizeRecording {
            session_id: session_id.to_string(),
        };
        if let Err(err) = self.jobs.enqueue(&job).await {
            error!(session_id, error = %err, "could not enqueue finalize job");
        }

        Ok(Reassembled {
            final_key,
            size_bytes,
            strategy: Some(strategy),
        })
    }

    async fn concatenate(&self, chunks: &[Chunk], final_key: &str) -> Result<(), StorageError> {
        let bodies = try_join_all(
            chunks
                .iter()
                .map(|chunk| self.store.get_object(&chunk.storage_key)),
        )
        .await?;
        let mut body = BytesMut::with_capacity(bodies.iter().map(Bytes::len).sum());
        for part in &bodies {
            body.extend_from_slice(part);
        }
        self.store.put_object(final_key, body.freeze()).await?;
        Ok(())
    }

    async fn multipart(
        &self,
        session_id: &str,
        chunks: &[Chunk],
        final_key: &str,
    ) -> Result<(), StorageError> {
        let upload_id = self.store.create_multipart_upload(final_key).await?;

        match self.assemble_parts(chunks, final_key, &upload_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Err(abort_err) = self.store.abort_multipart_upload(final_key, &upload_id).await
                {
                    warn!(
                        session_id,
                        upload_id = %upload_id,
                        error = %abort_err,
                        "could not abort failed reassembly upload"
                    );
                }
                Err(err)
            }
        }
    }

    async fn assemble_parts(
        &self,
        chunks: &[Chunk],
        final_key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        let spans: Vec<ChunkSpan> = chunks.iter().map(ChunkSpan::from).collect();
        let plans = plan_parts(&spans, self.settings.min_part_size_bytes);
        let chunk_at = |index: u32| {
            chunks
                .iter()
                .find(|c| c.index() == index)
                .ok_or_else(|| StorageError::backend(format!("chunk {} vanished", index)))
        };

        let mut completed = Vec::with_capacity(plans.len());
        for plan in &plans {
            let etag = if plan.is_copy() {
                let chunk = chunk_at(plan.chunks[0])?;
                self.store
                    .upload_part_copy(final_key, upload_id, plan.part_number, &chunk.storage_key)
                    .await?
            } else {
                let mut body = BytesMut::with_capacity(plan.size as usize);
                for index in &plan.chunks {
                    let chunk = chunk_at(*index)?;
                    body.extend_from_slice(&self.store.get_object(&chunk.storage_key).await?);
                }
                let body: Bytes = body.freeze();
                self.store
                    .upload_part(final_key, upload_id, plan.part_number, body)
                    .await?
            };
            debug!(
                upload_id,
                part_number = plan.part_number,
                chunks = ?plan.chunks,
                copy = plan.is_copy(),
                "uploaded part"
            );
            completed.push(CompletedPart {
                part_number: plan.part_number,
                etag,
            });
        }

        self.store
            .complete_multipart_upload(final_key, upload_id, &completed)
            .await
    }
}
