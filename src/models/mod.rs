//! Core data models for the recording ingest service.
//!
//! These entities represent upload sessions, their chunks and multipart
//! parts, and durable background jobs. They map cleanly to database tables
//! via `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod chunk;
pub mod job;
pub mod multipart;
pub mod session;
