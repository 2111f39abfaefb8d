//! Defines routes for the ingest API.
//!
//! ## Structure
//! - **Ingest**
//!   - `POST /chunks` — deliver one audio chunk
//!
//! - **Sessions**
//!   - `GET  /sessions/{id}` — session status
//!   - `POST /sessions/{id}/finalize` — explicit (re)finalization
//!   - `POST /sessions/{id}/retry-analysis` — re-queue transcription/analysis
//!   - `GET  /sessions/{id}/audio-url` — presigned URL of the final recording
//!   - `GET  /sessions/{id}/transcript` — preliminary and final transcripts
//!
//! - **Health** — `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        ingest_handlers::upload_chunk,
        session_handlers::{audio_url, finalize_session, get_session, get_transcript, retry_analysis},
    },
    services::state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_chunk_bytes` bounds a single chunk body.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/chunks",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/finalize", post(finalize_session))
        .route("/sessions/{id}/retry-analysis", post(retry_analysis))
        .route("/sessions/{id}/audio-url", get(audio_url))
        .route("/sessions/{id}/transcript", get(get_transcript))
}
