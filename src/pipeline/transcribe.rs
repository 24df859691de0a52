//! Transcribe stage.
//!
//! Submits the (possibly transcoded) clip to a speech-to-text HTTP API.
//! A missing credential or a failed call degrades to an empty transcript
//! with explicit provenance, never a request failure.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ServerSettings;
use crate::domain::TranscriptProvenance;

const ENGINE: &str = "openai";

/// Result of the transcribe stage
#[derive(Debug, Clone)]
pub struct TranscriptOutcome {
    /// Transcribed text; empty when degraded
    pub text: String,

    pub provenance: TranscriptProvenance,
}

/// Speech-to-text backend invoked per clip
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, bytes: &[u8], mime_type: &str, file_name: &str)
        -> TranscriptOutcome;
}

/// Response shape of the transcription API
#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Bearer-authenticated multipart transcription client
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    model: String,
    token: Option<String>,
}

impl HttpTranscriber {
    pub fn new(settings: &ServerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build transcription client")?;

        Ok(Self {
            client,
            url: settings.transcribe_url.clone(),
            model: settings.transcribe_model.clone(),
            token: settings.transcribe_token.clone(),
        })
    }

    pub fn has_credential(&self) -> bool {
        self.token.is_some()
    }

    async fn call(
        &self,
        token: &str,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
    ) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .context("Invalid clip mime type")?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .context("Transcription request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Transcription API returned {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            );
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .context("Failed to parse transcription response")?;

        Ok(parsed.text.trim().to_string())
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        bytes: &[u8],
        mime_type: &str,
        file_name: &str,
    ) -> TranscriptOutcome {
        let Some(token) = &self.token else {
            tracing::debug!(clip = file_name, "No transcription credential, skipping");
            return TranscriptOutcome {
                text: String::new(),
                provenance: TranscriptProvenance::no_credential(),
            };
        };

        let started = Instant::now();
        match self.call(token, bytes, mime_type, file_name).await {
            Ok(text) => {
                tracing::info!(
                    clip = file_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    chars = text.len(),
                    "Transcription complete"
                );
                TranscriptOutcome {
                    text,
                    provenance: TranscriptProvenance::transcribed(ENGINE, &self.model),
                }
            }
            Err(e) => {
                tracing::warn!(
                    clip = file_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Transcription failed, storing empty transcript"
                );
                TranscriptOutcome {
                    text: String::new(),
                    provenance: TranscriptProvenance::failed(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TranscribeStatus;

    fn settings_without_token() -> ServerSettings {
        ServerSettings {
            bind_address: "127.0.0.1:0".to_string(),
            storage_dir: std::env::temp_dir(),
            storage_bucket: "test".to_string(),
            public_base_url: "http://127.0.0.1:0/media".to_string(),
            collection: "media_metadata".to_string(),
            encoder_path: "ffmpeg".to_string(),
            encode_timeout: Duration::from_secs(5),
            transcribe_url: "http://127.0.0.1:1/unreachable".to_string(),
            transcribe_model: "whisper-1".to_string(),
            transcribe_token: None,
        }
    }

    #[tokio::test]
    async fn test_missing_credential_degrades_without_network() {
        let transcriber = HttpTranscriber::new(&settings_without_token()).unwrap();
        assert!(!transcriber.has_credential());

        let outcome = transcriber
            .transcribe(&[1, 2, 3], "video/mp4", "low-0001.mp4")
            .await;

        assert!(outcome.text.is_empty());
        assert_eq!(outcome.provenance.status, TranscribeStatus::NoCredential);
        assert!(outcome.provenance.detail.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades_to_failed() {
        let mut settings = settings_without_token();
        settings.transcribe_token = Some("test-token".to_string());

        let transcriber = HttpTranscriber::new(&settings).unwrap();
        let outcome = transcriber
            .transcribe(&[1, 2, 3], "video/mp4", "low-0001.mp4")
            .await;

        assert!(outcome.text.is_empty());
        assert_eq!(outcome.provenance.status, TranscribeStatus::Failed);
    }
}
