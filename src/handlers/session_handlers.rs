//! Session status, explicit finalization and transcript access.

use crate::{
    errors::AppError,
    handlers::auth::Owner,
    models::{chunk::TranscriptSource, session::SessionState},
    services::{reassembly::Strategy, state::AppState},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub received_chunks: Vec<u32>,
    pub total_received: usize,
    pub chunks_complete: bool,
    pub final_uploaded: bool,
    pub duration_seconds: i64,
    pub duration_display: String,
    pub title: Option<String>,
    pub final_object_key: Option<String>,
    pub final_size_bytes: Option<i64>,
    pub analyzed: bool,
    pub transcription_error: Option<String>,
    pub analysis_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    let session = state.ingest.owned(&owner, &session_id).await?;
    Ok(Json(SessionStatus {
        duration_display: session.duration_display(),
        total_received: session.received_chunks.len(),
        received_chunks: session.received_chunks.into_iter().collect(),
        session_id: session.id,
        state: session.state,
        chunks_complete: session.chunks_complete,
        final_uploaded: session.final_uploaded,
        duration_seconds: session.total_duration_seconds,
        title: session.title,
        final_object_key: session.final_object_key,
        final_size_bytes: session.final_size_bytes,
        analyzed: session.analyzed,
        transcription_error: session.transcription_error,
        analysis_error: session.analysis_error,
        started_at: session.started_at,
        ended_at: session.ended_at,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct FinalizeRequest {
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub session_id: String,
    pub final_object_key: String,
    pub final_size_bytes: u64,
    /// `null` when the session had already been finalized.
    pub strategy: Option<&'static str>,
}

/// `POST /sessions/{id}/finalize`
pub async fn finalize_session(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
    body: Option<Json<FinalizeRequest>>,
) -> Result<Json<FinalizeResponse>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let done = state
        .ingest
        .finalize(&owner, &session_id, request.title.as_deref())
        .await?;

    Ok(Json(FinalizeResponse {
        session_id,
        final_object_key: done.final_key,
        final_size_bytes: done.size_bytes,
        strategy: done.strategy.map(|s| match s {
            Strategy::Concatenate => "concatenate",
            Strategy::Multipart => "multipart",
        }),
    }))
}

/// `POST /sessions/{id}/retry-analysis`
pub async fn retry_analysis(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    state.ingest.retry_analysis(&owner, &session_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "session_id": session_id, "queued": true })),
    ))
}

#[derive(Debug, Serialize)]
pub struct AudioUrl {
    pub url: String,
    pub expires_in_seconds: u64,
}

/// `GET /sessions/{id}/audio-url`
pub async fn audio_url(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> Result<Json<AudioUrl>, AppError> {
    let session = state.ingest.owned(&owner, &session_id).await?;
    let Some(key) = session.final_object_key.filter(|_| session.final_uploaded) else {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "recording is not finalized",
        ));
    };

    let url = state
        .store
        .generate_presigned_url(&key, state.presign_ttl)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(AudioUrl {
        url,
        expires_in_seconds: state.presign_ttl.as_secs(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ChunkTranscript {
    pub chunk_index: u32,
    pub time: String,
    pub text: String,
    pub source: Option<TranscriptSource>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub session_id: String,
    pub chunks: Vec<ChunkTranscript>,
    /// Chunk transcripts stitched in index order.
    pub preliminary_text: String,
    pub full_transcript: Option<String>,
    pub confidence: Option<f64>,
    pub speaker_turns: Option<Value>,
    pub insights: Option<Value>,
}

/// `GET /sessions/{id}/transcript`
pub async fn get_transcript(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> Result<Json<TranscriptResponse>, AppError> {
    let session = state.ingest.owned(&owner, &session_id).await?;
    let chunks: Vec<ChunkTranscript> = state
        .sessions
        .list_chunks(&session_id)
        .await?
        .into_iter()
        .filter_map(|chunk| {
            Some(ChunkTranscript {
                chunk_index: chunk.index(),
                time: chunk.time_display(),
                source: chunk.transcript_source,
                confidence: chunk.confidence,
                text: chunk.transcript_text?,
            })
        })
        .collect();

    let preliminary_text = chunks
        .iter()
        .map(|c| c.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let parse = |raw: Option<String>| raw.and_then(|s| serde_json::from_str::<Value>(&s).ok());

    Ok(Json(TranscriptResponse {
        session_id,
        chunks,
        preliminary_text,
        full_transcript: session.full_transcript,
        confidence: session.transcript_confidence,
        speaker_turns: parse(session.speaker_turns),
        insights: parse(session.insights),
    }))
}
