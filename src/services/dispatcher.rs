//! Background hand-off of stored audio to transcription and analysis.
//!
//! Runs only from the job worker. Failures are written to the session's
//! error fields and returned to the queue for retry; they never reach the
//! ingest call that produced the work.

use crate::{
    models::{
        chunk::{Chunk, TranscriptSource, TranscriptionState},
        job::Job,
    },
    services::{
        jobs::JobHandler,
        session_store::SessionStore,
        transcription::{Analyzer, SpeakerTurn, TranscribeOptions, Transcriber, Transcript},
    },
    storage::ObjectStore,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Split speaker turns across the chunks they were spoken in.
///
/// A turn belongs to the latest chunk starting at or before the turn's
/// start; turns before the first chunk go to the first chunk. Returns
/// `(chunk_index, text)` in index order, skipping chunks with no turns.
pub fn turns_by_chunk(chunks: &[Chunk], turns: &[SpeakerTurn]) -> Vec<(u32, String)> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    let mut texts: Vec<Vec<&str>> = vec![Vec::new(); ordered.len()];

    for turn in turns {
        let text = turn.text.trim();
        if text.is_empty() {
            continue;
        }
        let slot = ordered
            .iter()
            .rposition(|c| c.start_time_seconds as f64 <= turn.start_seconds)
            .unwrap_or(0);
        if let Some(bucket) = texts.get_mut(slot) {
            bucket.push(text);
        }
    }

    ordered
        .iter()
        .zip(texts)
        .filter(|(_, parts)| !parts.is_empty())
        .map(|(chunk, parts)| (chunk.index(), parts.join(" ")))
        .collect()
}

#[derive(Clone)]
pub struct FinalizationDispatcher {
    sessions: SessionStore,
    store: Arc<dyn ObjectStore>,
    transcriber: Option<Arc<dyn Transcriber>>,
    analyzer: Option<Arc<dyn Analyzer>>,
    presign_ttl: Duration,
}

impl FinalizationDispatcher {
    pub fn new(
        sessions: SessionStore,
        store: Arc<dyn ObjectStore>,
        transcriber: Option<Arc<dyn Transcriber>>,
        analyzer: Option<Arc<dyn Analyzer>>,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            store,
            transcriber,
            analyzer,
            presign_ttl,
        }
    }

    /// Full transcription of the final object followed by analysis.
    pub async fn finalize_recording(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.sessions.get(session_id).await? else {
            info!(session_id, "session vanished, nothing to dispatch");
            return Ok(());
        };
        let (true, Some(final_key)) = (session.final_uploaded, session.final_object_key.clone())
        else {
            info!(session_id, state = %session.state, "session not finalized, skipping dispatch");
            return Ok(());
        };

        let transcript = match session.full_transcript.clone() {
            Some(text) => text,
            None => {
                let Some(transcriber) = &self.transcriber else {
                    info!(session_id, "transcription service not configured");
                    return Ok(());
                };
                match self.transcribe_final(transcriber.as_ref(), session_id, &final_key).await {
                    Ok(text) => text,
                    Err(err) => {
                        let message = format!("{:#}", err);
                        self.sessions
                            .record_transcription_error(session_id, &message)
                            .await?;
                        return Err(err);
                    }
                }
            }
        };

        if session.analyzed {
            return Ok(());
        }
        let Some(analyzer) = &self.analyzer else {
            info!(session_id, "analysis service not configured");
            return Ok(());
        };

        match analyzer.analyze(&transcript).await {
            Ok(insights) => {
                let json = serde_json::to_string(&insights)?;
                self.sessions.record_insights(session_id, &json).await?;
                info!(
                    session_id,
                    action_items = insights.action_items.len(),
                    "recording analyzed"
                );
                Ok(())
            }
            Err(err) => {
                let message = format!("{:#}", err);
                self.sessions
                    .record_analysis_error(session_id, &message)
                    .await?;
                Err(err.context("analysis failed"))
            }
        }
    }

    async fn transcribe_final(
        &self,
        transcriber: &dyn Transcriber,
        session_id: &str,
        final_key: &str,
    ) -> Result<String> {
        let url = self
            .store
            .generate_presigned_url(final_key, self.presign_ttl)
            .await
            .context("presigning final recording")?;
        let transcript = transcriber
            .transcribe(&url, TranscribeOptions { speaker_labels: true })
            .await
            .context("transcription failed")?;

        let turns = serde_json::to_string(&transcript.speaker_turns)?;
        self.sessions
            .record_transcript(session_id, &transcript.text, transcript.confidence, &turns)
            .await?;

        // Diarized text replaces the quick per-chunk transcripts.
        let chunks = self.sessions.list_chunks(session_id).await?;
        for (index, text) in turns_by_chunk(&chunks, &transcript.speaker_turns) {
            self.sessions
                .record_chunk_transcript(
                    session_id,
                    index,
                    &text,
                    TranscriptSource::Final,
                    transcript.confidence,
                )
                .await?;
        }
        info!(
            session_id,
            speaker_turns = transcript.speaker_turns.len(),
            "recording transcribed"
        );
        Ok(transcript.text)
    }

    /// Quick per-chunk transcription. Chunks that fail go back to pending
    /// so a later batch picks them up.
    pub async fn preliminary(&self, session_id: &str, chunk_indices: &[u32]) -> Result<()> {
        let Some(transcriber) = &self.transcriber else {
            info!(session_id, "transcription service not configured");
            return Ok(());
        };

        for &index in chunk_indices {
            let Some(chunk) = self.sessions.get_chunk(session_id, index).await? else {
                continue;
            };
            if chunk.transcription_state == TranscriptionState::Done {
                continue;
            }

            match self.transcribe_chunk(transcriber.as_ref(), &chunk.storage_key).await {
                Ok(transcript) => {
                    self.sessions
                        .record_chunk_transcript(
                            session_id,
                            index,
                            &transcript.text,
                            TranscriptSource::Preliminary,
                            transcript.confidence,
                        )
                        .await?;
                }
                Err(err) => {
                    warn!(session_id, chunk_index = index, error = %err, "preliminary transcription failed");
                    self.sessions
                        .set_transcription_state(session_id, &[index], TranscriptionState::Pending)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn transcribe_chunk(&self, transcriber: &dyn Transcriber, key: &str) -> Result<Transcript> {
        let url = self.store.generate_presigned_url(key, self.presign_ttl).await?;
        transcriber
            .transcribe(&url, TranscribeOptions::default())
            .await
    }
}

#[async_trait]
impl JobHandler for FinalizationDispatcher {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job {
            Job::FinalizeRecording { session_id } => self.finalize_recording(session_id).await,
            Job::PreliminaryTranscription {
                session_id,
                chunk_indices,
            } => self
                .preliminary(session_id, chunk_indices)
                .await
                .map_err(|e| anyhow!("preliminary transcription of {}: {:#}", session_id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::{chunk::NewChunk, multipart::MultipartPart},
        services::transcription::{Insights, SpeakerTurn, Transcript},
        storage::{self, LocalObjectStore},
    };
    use bytes::Bytes;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeTranscriber {
        urls: Mutex<Vec<(String, bool)>>,
        fail_on: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, url: &str, options: TranscribeOptions) -> Result<Transcript> {
            self.urls
                .lock()
                .unwrap()
                .push((url.to_string(), options.speaker_labels));
            if let Some(needle) = self.fail_on.lock().unwrap().as_deref() {
                if url.contains(needle) {
                    anyhow::bail!("service unavailable");
                }
            }
            Ok(Transcript {
                text: "hello there".into(),
                confidence: Some(0.93),
                speaker_turns: vec![SpeakerTurn {
                    speaker: "A".into(),
                    text: "hello there".into(),
                    start_seconds: 0.0,
                    end_seconds: 1.5,
                }],
            })
        }
    }

    struct FlakyAnalyzer {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Analyzer for FlakyAnalyzer {
        async fn analyze(&self, transcript: &str) -> Result<Insights> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("model overloaded");
            }
            Ok(Insights {
                summary: format!("summary of {transcript}"),
                action_items: vec!["follow up".into()],
                key_topics: vec!["greeting".into()],
                sentiment: Some("positive".into()),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        sessions: SessionStore,
        store: Arc<LocalObjectStore>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let sessions = SessionStore::new(Arc::new(db::memory().await.unwrap()));
        let session = sessions.create("rec-1", "alice").await.unwrap();
        for index in 0..2u32 {
            let key = storage::chunk_key("alice", "rec-1", index);
            store.put_object(&key, Bytes::from_static(b"audio")).await.unwrap();
            let chunk = NewChunk {
                index,
                start_time_seconds: index as i64 * 30,
                duration_seconds: 30,
                size_bytes: 5,
                storage_key: key,
            };
            sessions
                .commit_chunk(&session, &chunk, &MultipartPart::new(index as i64 + 1, "e"))
                .await
                .unwrap();
        }
        let final_key = storage::final_key("alice", "rec-1");
        store
            .put_object(&final_key, Bytes::from_static(b"audioaudio"))
            .await
            .unwrap();
        sessions
            .mark_finalized("rec-1", &final_key, 10, "Recording - 0m 30s")
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            sessions,
            store,
        }
    }

    fn dispatcher(
        f: &Fixture,
        transcriber: Option<Arc<dyn Transcriber>>,
        analyzer: Option<Arc<dyn Analyzer>>,
    ) -> FinalizationDispatcher {
        FinalizationDispatcher::new(
            f.sessions.clone(),
            f.store.clone(),
            transcriber,
            analyzer,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn analysis_failure_is_recorded_then_cleared_on_retry() -> anyhow::Result<()> {
        let f = fixture().await;
        let transcriber = Arc::new(FakeTranscriber::default());
        let analyzer = Arc::new(FlakyAnalyzer {
            failures_left: Mutex::new(1),
        });
        let d = dispatcher(&f, Some(transcriber.clone()), Some(analyzer));
        let job = Job::FinalizeRecording {
            session_id: "rec-1".into(),
        };

        assert!(d.handle(&job).await.is_err());
        let session = f.sessions.require("rec-1").await?;
        assert_eq!(session.full_transcript.as_deref(), Some("hello there"));
        assert_eq!(session.transcript_confidence, Some(0.93));
        assert!(session.speaker_turns.unwrap().contains("\"speaker\":\"A\""));
        assert!(session.analysis_error.unwrap().contains("model overloaded"));
        assert!(!session.analyzed);

        let first = f.sessions.get_chunk("rec-1", 0).await?.unwrap();
        assert_eq!(first.transcript_source, Some(TranscriptSource::Final));
        assert_eq!(first.transcript_text.as_deref(), Some("hello there"));
        let second = f.sessions.get_chunk("rec-1", 1).await?.unwrap();
        assert!(second.transcript_text.is_none());

        d.handle(&job).await?;
        let session = f.sessions.require("rec-1").await?;
        assert!(session.analyzed);
        assert!(session.analysis_error.is_none());
        assert!(session.insights.unwrap().contains("follow up"));

        // The transcript is reused on retry.
        let calls = transcriber.urls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("complete.bin"));
        assert!(calls[0].1);
        Ok(())
    }

    #[tokio::test]
    async fn transcription_failure_is_recorded() -> anyhow::Result<()> {
        let f = fixture().await;
        let transcriber = Arc::new(FakeTranscriber::default());
        *transcriber.fail_on.lock().unwrap() = Some("complete.bin".into());
        let d = dispatcher(&f, Some(transcriber), None);

        assert!(d.finalize_recording("rec-1").await.is_err());
        let session = f.sessions.require("rec-1").await?;
        assert!(session.transcription_error.unwrap().contains("service unavailable"));
        assert!(session.full_transcript.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unconfigured_services_complete_quietly() -> anyhow::Result<()> {
        let f = fixture().await;
        let d = dispatcher(&f, None, None);
        d.finalize_recording("rec-1").await?;
        d.preliminary("rec-1", &[0, 1]).await?;
        d.finalize_recording("missing").await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_preliminary_chunks_return_to_pending() -> anyhow::Result<()> {
        let f = fixture().await;
        let transcriber = Arc::new(FakeTranscriber::default());
        *transcriber.fail_on.lock().unwrap() = Some("chunk_1".into());
        f.sessions
            .set_transcription_state("rec-1", &[0, 1], TranscriptionState::Queued)
            .await?;
        let d = dispatcher(&f, Some(transcriber.clone()), None);

        d.preliminary("rec-1", &[0, 1]).await?;

        let first = f.sessions.get_chunk("rec-1", 0).await?.unwrap();
        assert_eq!(first.transcription_state, TranscriptionState::Done);
        assert_eq!(first.transcript_source, Some(TranscriptSource::Preliminary));
        let second = f.sessions.get_chunk("rec-1", 1).await?.unwrap();
        assert_eq!(second.transcription_state, TranscriptionState::Pending);
        assert!(transcriber.urls.lock().unwrap().iter().all(|(_, labels)| !labels));
        Ok(())
    }

    fn chunk_at(index: i64, start: i64) -> Chunk {
        Chunk {
            session_id: "rec-1".into(),
            chunk_index: index,
            start_time_seconds: start,
            duration_seconds: 60,
            size_bytes: 1,
            storage_key: format!("chunk_{index}.bin"),
            transcription_state: TranscriptionState::Pending,
            transcript_text: None,
            transcript_source: None,
            confidence: None,
            transcribed_at: None,
            received_at: chrono::Utc::now(),
        }
    }

    fn turn(start: f64, text: &str) -> SpeakerTurn {
        SpeakerTurn {
            speaker: "A".into(),
            text: text.into(),
            start_seconds: start,
            end_seconds: start + 1.0,
        }
    }

    #[test]
    fn turns_land_in_the_chunk_they_start_in() {
        let chunks = vec![chunk_at(2, 120), chunk_at(0, 0), chunk_at(1, 60)];
        let turns = vec![
            turn(3.0, "good morning"),
            turn(59.9, "shall we start"),
            turn(130.0, "thanks all"),
            turn(140.0, "  "),
        ];
        assert_eq!(
            turns_by_chunk(&chunks, &turns),
            vec![
                (0, "good morning shall we start".to_string()),
                (2, "thanks all".to_string()),
            ]
        );
        assert!(turns_by_chunk(&chunks, &[]).is_empty());
    }
}
