pub mod dispatcher;
pub mod ingest;
pub mod jobs;
pub mod reassembly;
pub mod session_store;
pub mod state;
pub mod tokens;
pub mod transcription;
