//! Clients for the external speech-to-text and transcript analysis services.
//!
//! Both services are reached over HTTP with a bearer API key. Audio is never
//! sent inline; the transcriber receives a short-lived presigned URL.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TranscribeOptions {
    /// Ask the service to diarize the audio into speaker turns.
    pub speaker_labels: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub start_seconds: f64,
    #[serde(default)]
    pub end_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub speaker_turns: Vec<SpeakerTurn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub summary: String,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_url: &str, options: TranscribeOptions) -> Result<Transcript>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, transcript: &str) -> Result<Insights>;
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    audio_url: &'a str,
    #[serde(flatten)]
    options: TranscribeOptions,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    transcript: &'a str,
}

/// JSON-over-HTTP client shared by both services.
#[derive(Clone)]
pub struct HttpService {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpService {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| anyhow!("unable to reach {}: {}", url, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(anyhow!(
                "{} returned {}: {}",
                url,
                status,
                resp.text().await.unwrap_or_default()
            ));
        }
        resp.json::<Resp>()
            .await
            .map_err(|e| anyhow!("unable to decode response from {}: {}", url, e))
    }
}

#[async_trait]
impl Transcriber for HttpService {
    async fn transcribe(&self, audio_url: &str, options: TranscribeOptions) -> Result<Transcript> {
        self.post("transcribe", &TranscribeRequest { audio_url, options })
            .await
    }
}

#[async_trait]
impl Analyzer for HttpService {
    async fn analyze(&self, transcript: &str) -> Result<Insights> {
        self.post("analyze", &AnalyzeRequest { transcript }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_tolerates_missing_optional_fields() {
        let t: Transcript = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(t.text, "hi");
        assert!(t.confidence.is_none());
        assert!(t.speaker_turns.is_empty());

        let i: Insights = serde_json::from_str(r#"{"summary":"s","key_topics":["a"]}"#).unwrap();
        assert_eq!(i.key_topics, vec!["a".to_string()]);
        assert!(i.action_items.is_empty());
    }

    #[test]
    fn transcribe_request_flattens_options() {
        let body = serde_json::to_value(TranscribeRequest {
            audio_url: "https://x/y",
            options: TranscribeOptions {
                speaker_labels: true,
            },
        })
        .unwrap();
        assert_eq!(body["audio_url"], "https://x/y");
        assert_eq!(body["speaker_labels"], true);
    }
}
