//! Chunked audio recording ingest service.
//!
//! Clients upload a recording as a sequence of chunks over an unreliable
//! network. Each chunk is stored as its own object and appended to an
//! optimistic multipart upload; on the final chunk the recording is
//! reassembled into one object, by in-memory concatenation or by a fresh
//! multipart upload built from server-side part copies, and handed to
//! background transcription and analysis.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod storage;

use axum::Router;
use services::state::AppState;

/// The HTTP application with state attached.
pub fn app(state: AppState, max_chunk_bytes: usize) -> Router {
    routes::routes::routes(max_chunk_bytes).with_state(state)
}
