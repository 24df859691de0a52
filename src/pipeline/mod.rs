//! Server-side ingestion pipeline.
//!
//! One clip per call, four strictly ordered stages: transcode, transcribe,
//! store, index. The first two degrade gracefully and never fail the call;
//! store and index failures are the only unrecoverable outcomes.

pub mod index;
pub mod store;
pub mod transcode;
pub mod transcribe;

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    ClipMetadataRecord, ClipUploadReceipt, ClipUploadRequest, TranscribeStatus,
};

pub use index::{InsertOutcome, MetadataIndex};
pub use store::{clip_path, FsObjectStore, ObjectStore, StoredObject};
pub use transcode::{encode_or_passthrough, EncodedClip, Encoder, FfmpegEncoder, TranscodeOutcome};
pub use transcribe::{HttpTranscriber, Transcriber, TranscriptOutcome};

/// Errors surfaced by the ingestion pipeline.
///
/// Encoder and transcription failures never appear here; they degrade inside
/// their stages.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Storage failure: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Index failure: {0}")]
    Index(#[source] anyhow::Error),
}

/// The four-stage ingestion pipeline
pub struct IngestPipeline {
    encoder: Arc<dyn Encoder>,
    transcriber: Arc<dyn Transcriber>,
    store: Arc<dyn ObjectStore>,
    index: Arc<MetadataIndex>,
}

impl IngestPipeline {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        transcriber: Arc<dyn Transcriber>,
        store: Arc<dyn ObjectStore>,
        index: Arc<MetadataIndex>,
    ) -> Self {
        Self {
            encoder,
            transcriber,
            store,
            index,
        }
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// Ingest one clip payload
    pub async fn ingest(
        &self,
        request: ClipUploadRequest,
    ) -> Result<ClipUploadReceipt, IngestError> {
        let started = Instant::now();

        let original_bytes = validate(&request)?;
        let dedup_key = crate::domain::dedup_key(
            request.session_id,
            &request.clip_name,
            request.clip_started_at,
            request.clip_ended_at,
        );

        // A retried upload whose earlier call succeeded unacknowledged
        // resolves to the existing record before any work is redone
        if let Some(existing) = self
            .index
            .find_by_dedup_key(&dedup_key)
            .map_err(IngestError::Index)?
        {
            tracing::info!(
                clip = %request.clip_name,
                document_id = %existing.document_id,
                "Clip already ingested, returning existing receipt"
            );
            let transcript_chars = transcript_chars(&existing);
            return Ok(ClipUploadReceipt {
                document_id: existing.document_id,
                url: existing.storage_url,
                transcript_chars,
            });
        }

        let size_bytes_original = original_bytes.len() as u64;
        let encoded = encode_or_passthrough(
            self.encoder.as_ref(),
            original_bytes,
            &request.mime_type,
            &request.clip_name,
        )
        .await;

        let transcription = self
            .transcriber
            .transcribe(&encoded.bytes, &encoded.mime_type, &encoded.clip_name)
            .await;

        let path = clip_path(request.session_id, &encoded.clip_name);
        let stored = self
            .store
            .put(&path, &encoded.bytes, &encoded.mime_type)
            .await
            .map_err(IngestError::Storage)?;

        // The stored transcript falls back to the caller-supplied window text
        // when server transcription is degraded; the receipt reports only
        // what the transcribe stage produced
        let transcript_server_chars = transcription.text.len();
        let transcript_text = if transcription.text.is_empty() {
            request.transcript_full_text.clone()
        } else {
            transcription.text
        };

        let record = ClipMetadataRecord {
            document_id: Uuid::new_v4().to_string(),
            session_id: request.session_id,
            dedup_key,
            clip_name: encoded.clip_name,
            original_clip_name: request.clip_name,
            clip_type: request.clip_type,
            reason: request.reason,
            mime_type: encoded.mime_type,
            original_mime_type: request.mime_type,
            size_bytes_original,
            size_bytes_encoded: encoded.bytes.len() as u64,
            clip_started_at: request.clip_started_at,
            clip_ended_at: request.clip_ended_at,
            captured_at: request.captured_at,
            uploaded_at: Utc::now(),
            indexed_at: Utc::now(),
            storage_url: stored.url.clone(),
            storage_bucket: stored.bucket,
            storage_path: stored.path,
            transcript_text,
            transcript: transcription.provenance,
            encode_status: encoded.status,
            encode_detail: encoded.detail,
        };

        let outcome = self.index.append(&record).map_err(IngestError::Index)?;

        tracing::info!(
            clip = %record.clip_name,
            document_id = %outcome.document_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Clip ingested"
        );

        Ok(ClipUploadReceipt {
            document_id: outcome.document_id,
            url: stored.url,
            transcript_chars: transcript_server_chars,
        })
    }
}

/// Transcript length as reported in a receipt for an existing record
fn transcript_chars(record: &ClipMetadataRecord) -> usize {
    match record.transcript.status {
        TranscribeStatus::Transcribed => record.transcript_text.len(),
        _ => 0,
    }
}

fn validate(request: &ClipUploadRequest) -> Result<Vec<u8>, IngestError> {
    if request.clip_name.trim().is_empty() {
        return Err(IngestError::InvalidPayload("missing clip name".to_string()));
    }
    if request.mime_type.trim().is_empty() {
        return Err(IngestError::InvalidPayload("missing mime type".to_string()));
    }
    if request.data_base64.is_empty() {
        return Err(IngestError::InvalidPayload("missing clip data".to_string()));
    }

    base64::engine::general_purpose::STANDARD
        .decode(&request.data_base64)
        .map_err(|e| IngestError::InvalidPayload(format!("clip data is not valid base64: {}", e)))
}
