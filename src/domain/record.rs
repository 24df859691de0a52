//! Wire types for the ingestion endpoint and the persisted metadata record.
//!
//! The request/response shapes are the public contract between the upload
//! queue and the server; field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clip::{ClipType, CloseReason};
use super::session::{TranscriptEntry, TranscriptSource};

/// One transcript entry as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTranscriptEntry {
    pub text: String,
    pub source: TranscriptSource,
    pub received_at_iso: String,
    pub elapsed_label: String,
}

impl From<TranscriptEntry> for WireTranscriptEntry {
    fn from(entry: TranscriptEntry) -> Self {
        Self {
            text: entry.text,
            source: entry.source,
            received_at_iso: entry.received_at.to_rfc3339(),
            elapsed_label: entry.elapsed_label,
        }
    }
}

/// Body of `POST /clips`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipUploadRequest {
    pub session_id: Uuid,
    pub clip_name: String,
    pub clip_type: ClipType,
    pub reason: CloseReason,
    pub mime_type: String,
    pub size_bytes: u64,

    /// Clip container bytes, base64-encoded
    pub data_base64: String,

    pub captured_at: DateTime<Utc>,
    pub clip_started_at: DateTime<Utc>,
    pub clip_ended_at: DateTime<Utc>,

    #[serde(default)]
    pub transcript_full_text: String,

    #[serde(default)]
    pub transcript_entries: Vec<WireTranscriptEntry>,
}

/// 201 body of `POST /clips`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipUploadReceipt {
    pub document_id: String,
    pub url: String,
    pub transcript_chars: usize,
}

/// Outcome of the transcode stage, persisted for auditability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeStatus {
    /// Encoder produced normalized output
    Encoded,

    /// Encoder unavailable or failed; original bytes stored as-is
    PassThrough,
}

/// Outcome of the transcribe stage, persisted for auditability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscribeStatus {
    /// Transcription succeeded
    Transcribed,

    /// No credential configured; transcript is empty
    NoCredential,

    /// Transcription call failed; transcript is empty
    Failed,
}

/// Provenance of the stored transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptProvenance {
    pub status: TranscribeStatus,

    /// Engine that produced the transcript (e.g. "openai"), if any
    pub engine: Option<String>,

    /// Model identifier, if any
    pub model: Option<String>,

    /// Failure detail for degraded outcomes
    pub detail: Option<String>,
}

impl TranscriptProvenance {
    pub fn transcribed(engine: &str, model: &str) -> Self {
        Self {
            status: TranscribeStatus::Transcribed,
            engine: Some(engine.to_string()),
            model: Some(model.to_string()),
            detail: None,
        }
    }

    pub fn no_credential() -> Self {
        Self {
            status: TranscribeStatus::NoCredential,
            engine: None,
            model: None,
            detail: Some("no transcription credential configured".to_string()),
        }
    }

    pub fn failed(detail: String) -> Self {
        Self {
            status: TranscribeStatus::Failed,
            engine: None,
            model: None,
            detail: Some(detail),
        }
    }
}

/// One append-only record per successfully ingested clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipMetadataRecord {
    /// Record id assigned by the index
    pub document_id: String,

    pub session_id: Uuid,

    /// Dedup key carried from the upload job
    pub dedup_key: String,

    /// Clip name after transcode (extension may change)
    pub clip_name: String,

    /// Clip name as uploaded
    pub original_clip_name: String,

    pub clip_type: ClipType,
    pub reason: CloseReason,

    /// Mime type of the stored bytes
    pub mime_type: String,

    /// Mime type as uploaded
    pub original_mime_type: String,

    pub size_bytes_original: u64,
    pub size_bytes_encoded: u64,

    pub clip_started_at: DateTime<Utc>,
    pub clip_ended_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub uploaded_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,

    /// Stable public URL of the stored object
    pub storage_url: String,

    /// Container/bucket holding the object
    pub storage_bucket: String,

    /// Path within the bucket
    pub storage_path: String,

    /// Full transcript text for the clip window
    pub transcript_text: String,

    pub transcript: TranscriptProvenance,
    pub encode_status: EncodeStatus,

    /// Encoder failure detail when encode_status is PassThrough
    pub encode_detail: Option<String>,
}
