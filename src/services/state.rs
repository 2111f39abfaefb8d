//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        dispatcher::FinalizationDispatcher,
        ingest::IngestService,
        jobs::JobQueue,
        session_store::{SessionLocks, SessionStore},
        tokens::TokenService,
        transcription::{Analyzer, HttpService, Transcriber},
    },
    storage::ObjectStore,
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
    pub store: Arc<dyn ObjectStore>,
    pub sessions: SessionStore,
    pub tokens: TokenService,
    pub ingest: IngestService,
    pub jobs: JobQueue,
    pub presign_ttl: Duration,
}

impl AppState {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn ObjectStore>, cfg: &AppConfig) -> Self {
        let sessions = SessionStore::new(db.clone());
        let jobs = JobQueue::new(db.clone(), cfg.jobs.clone());
        let ingest = IngestService::new(
            sessions.clone(),
            SessionLocks::new(),
            store.clone(),
            jobs.clone(),
            cfg.ingest.clone(),
        );
        Self {
            tokens: TokenService::new(db.clone()),
            db,
            store,
            sessions,
            ingest,
            jobs,
            presign_ttl: cfg.ingest.presign_ttl,
        }
    }

    /// Background handler wired to the configured external services.
    pub fn dispatcher(&self, cfg: &AppConfig) -> FinalizationDispatcher {
        let transcriber = cfg.transcription.url.as_deref().map(|url| {
            Arc::new(HttpService::new(url, cfg.transcription.api_key.clone()))
                as Arc<dyn Transcriber>
        });
        let analyzer = cfg.analysis.url.as_deref().map(|url| {
            Arc::new(HttpService::new(url, cfg.analysis.api_key.clone())) as Arc<dyn Analyzer>
        });
        FinalizationDispatcher::new(
            self.sessions.clone(),
            self.store.clone(),
            transcriber,
            analyzer,
            self.presign_ttl,
        )
    }
}
