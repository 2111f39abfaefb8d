//! src/services/jobs.rs
//!
//! Durable background queue on the `jobs` table.
//!
//! Delivery is at-least-once: a claimed job is leased rather than removed,
//! and a worker that dies mid-job leaves the row `running` until the lease
//! runs out, after which any worker may claim it again.

use crate::{
    config::JobSettings,
    errors::IngestResult,
    models::job::{Job, JobRecord, JobStatus},
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str =
    "id, kind, payload, status, attempts, last_error, run_after, created_at, updated_at";

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

#[derive(Clone)]
pub struct JobQueue {
    pub db: Arc<SqlitePool>,
    settings: JobSettings,
    /// Delay added per failed attempt before a job is retried.
    backoff: Duration,
}

impl JobQueue {
    pub fn new(db: Arc<SqlitePool>, settings: JobSettings) -> Self {
        Self {
            db,
            settings,
            backoff: Duration::from_secs(5),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Persist `job` as pending and due now.
    pub async fn enqueue(&self, job: &Job) -> IngestResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload = serde_json::to_string(job).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            "INSERT INTO jobs (id, kind, payload, status, attempts, run_after, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(id)
        .bind(job.kind())
        .bind(payload)
        .bind(JobStatus::Pending)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        debug!(job_id = %id, kind = job.kind(), session_id = job.session_id(), "enqueued job");
        Ok(id)
    }

    /// Lease the oldest due job: pending and past `run_after`, or running
    /// with an expired lease. Increments `attempts`.
    pub async fn claim_next(&self) -> IngestResult<Option<JobRecord>> {
        let now = Utc::now();
        let lease_until = now + chrono_duration(self.settings.lease);

        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE jobs
             SET status = ?, attempts = attempts + 1, run_after = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status IN (?, ?) AND run_after <= ?
                 ORDER BY run_after
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobStatus::Running)
        .bind(lease_until)
        .bind(now)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?;

        Ok(record)
    }

    pub async fn complete(&self, id: Uuid) -> IngestResult<()> {
        sqlx::query("UPDATE jobs SET status = ?, last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Done)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Record a failed attempt. The job goes back to pending with a linear
    /// backoff, or to `failed` once `max_attempts` is reached.
    pub async fn fail(&self, record: &JobRecord, error: &str) -> IngestResult<JobStatus> {
        let now = Utc::now();
        let exhausted = record.attempts >= self.settings.max_attempts;
        let status = if exhausted {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };
        let delay = self.backoff * record.attempts.max(1) as u32;

        sqlx::query(
            "UPDATE jobs SET status = ?, last_error = ?, run_after = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(now + chrono_duration(delay))
        .bind(now)
        .bind(record.id)
        .execute(&*self.db)
        .await?;

        Ok(status)
    }

    /// Give up on a job without further retries.
    pub async fn bury(&self, id: Uuid, error: &str) -> IngestResult<()> {
        sqlx::query("UPDATE jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Failed)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> IngestResult<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Jobs of the given session, oldest first.
    pub async fn for_session(&self, session_id: &str) -> IngestResult<Vec<Job>> {
        let payloads: Vec<String> =
            sqlx::query_scalar("SELECT payload FROM jobs ORDER BY created_at")
                .fetch_all(&*self.db)
                .await?;
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str::<Job>(p).ok())
            .filter(|job| job.session_id() == session_id)
            .collect())
    }
}

/// Executes one kind of background work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// Polls a [`JobQueue`] and hands claimed jobs to a [`JobHandler`].
pub struct JobWorker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
}

impl JobWorker {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        Self { queue, handler }
    }

    /// Process jobs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let poll = self.queue.settings().poll_interval;
        info!(poll_ms = poll.as_millis() as u64, "job worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(err) => {
                    error!(error = %err, "job queue unavailable");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }

        info!("job worker stopped");
    }

    /// Claim and process at most one job. Returns whether a job was found.
    pub async fn run_once(&self) -> IngestResult<bool> {
        let Some(record) = self.queue.claim_next().await? else {
            return Ok(false);
        };

        let job = match record.job() {
            Ok(job) => job,
            Err(err) => {
                error!(job_id = %record.id, kind = %record.kind, error = %err, "undecodable job payload");
                self.queue.bury(record.id, &err.to_string()).await?;
                return Ok(true);
            }
        };

        debug!(
            job_id = %record.id,
            kind = job.kind(),
            session_id = job.session_id(),
            attempt = record.attempts,
            "running job"
        );

        match self.handler.handle(&job).await {
            Ok(()) => self.queue.complete(record.id).await?,
            Err(err) => {
                let message = format!("{:#}", err);
                let status = self.queue.fail(&record, &message).await?;
                warn!(
                    job_id = %record.id,
                    kind = job.kind(),
                    session_id = job.session_id(),
                    attempt = record.attempts,
                    next = ?status,
                    error = %message,
                    "job failed"
                );
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::Mutex;

    fn settings(max_attempts: i64) -> JobSettings {
        JobSettings {
            poll_interval: Duration::from_millis(10),
            lease: Duration::from_secs(60),
            max_attempts,
        }
    }

    async fn queue(max_attempts: i64) -> JobQueue {
        let db = Arc::new(db::memory().await.unwrap());
        JobQueue::new(db, settings(max_attempts)).with_backoff(Duration::ZERO)
    }

    fn finalize(id: &str) -> Job {
        Job::FinalizeRecording {
            session_id: id.into(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Job>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(job.clone());
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_handed_out_twice() -> anyhow::Result<()> {
        let queue = queue(3).await;
        queue.enqueue(&finalize("a")).await?;

        let first = queue.claim_next().await?.expect("job due");
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.job()?, finalize("a"));
        assert!(queue.claim_next().await?.is_none());

        queue.complete(first.id).await?;
        assert_eq!(queue.get(first.id).await?.unwrap().status, JobStatus::Done);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_makes_job_claimable_again() -> anyhow::Result<()> {
        let db = Arc::new(db::memory().await?);
        let mut s = settings(3);
        s.lease = Duration::ZERO;
        let queue = JobQueue::new(db, s);
        queue.enqueue(&finalize("a")).await?;

        let first = queue.claim_next().await?.unwrap();
        let again = queue.claim_next().await?.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failures_retry_until_max_attempts() -> anyhow::Result<()> {
        let queue = queue(2).await;
        let id = queue.enqueue(&finalize("a")).await?;

        let record = queue.claim_next().await?.unwrap();
        assert_eq!(queue.fail(&record, "boom").await?, JobStatus::Pending);

        let record = queue.claim_next().await?.unwrap();
        assert_eq!(queue.fail(&record, "boom again").await?, JobStatus::Failed);
        assert!(queue.claim_next().await?.is_none());

        let stored = queue.get(id).await?.unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("boom again"));
        Ok(())
    }

    #[tokio::test]
    async fn worker_retries_failed_handler() -> anyhow::Result<()> {
        let queue = queue(5).await;
        let id = queue.enqueue(&finalize("a")).await?;
        let handler = Arc::new(Recorder {
            failures_left: Mutex::new(1),
            ..Default::default()
        });
        let worker = JobWorker::new(queue.clone(), handler.clone());

        assert!(worker.run_once().await?);
        assert_eq!(queue.get(id).await?.unwrap().status, JobStatus::Pending);
        assert!(worker.run_once().await?);
        assert_eq!(queue.get(id).await?.unwrap().status, JobStatus::Done);
        assert!(!worker.run_once().await?);
        assert_eq!(handler.seen.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn worker_stops_on_cancel() -> anyhow::Result<()> {
        let queue = queue(5).await;
        queue.enqueue(&finalize("a")).await?;
        let handler = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(
            JobWorker::new(queue.clone(), handler.clone()).run(shutdown.clone()),
        );
        for _ in 0..100 {
            if !handler.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await?;
        assert_eq!(handler.seen.lock().unwrap().as_slice(), &[finalize("a")]);
        assert_eq!(queue.for_session("a").await?, vec![finalize("a")]);
        Ok(())
    }
}
