pub mod auth;
pub mod health_handlers;
pub mod ingest_handlers;
pub mod session_handlers;
