//! End-to-end capture scenarios against the simulated media source: the
//! rolling low-res window, wake-word high-res clips, and the transcript
//! slices that travel with each queued segment into ingestion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use livecap::capture::{
    drive, CaptureController, ScriptedRecognizer, SimulatedSource, TriggerListener,
};
use livecap::config::CaptureSettings;
use livecap::domain::{
    ClipType, CloseReason, FinalizedClip, TranscribeStatus, TranscriptProvenance,
};
use livecap::pipeline::{
    EncodedClip, Encoder, FsObjectStore, IngestPipeline, MetadataIndex, Transcriber,
    TranscriptOutcome,
};
use livecap::queue::{DiagnosticsHandle, UploadQueue};

struct PassEncoder;

#[async_trait]
impl Encoder for PassEncoder {
    async fn encode(&self, input: &[u8], _mime: &str) -> anyhow::Result<EncodedClip> {
        Ok(EncodedClip {
            bytes: input.to_vec(),
            mime_type: "video/mp4".to_string(),
            extension: "mp4",
        })
    }
}

struct SilentTranscriber;

#[async_trait]
impl Transcriber for SilentTranscriber {
    async fn transcribe(&self, _: &[u8], _: &str, _: &str) -> TranscriptOutcome {
        TranscriptOutcome {
            text: String::new(),
            provenance: TranscriptProvenance::no_credential(),
        }
    }
}

fn fast_settings() -> CaptureSettings {
    CaptureSettings {
        window: Duration::from_millis(60),
        trigger_clip: Duration::from_millis(40),
        ..CaptureSettings::default()
    }
}

fn test_pipeline(temp: &TempDir) -> (IngestPipeline, Arc<MetadataIndex>) {
    let store = Arc::new(FsObjectStore::with_root(
        temp.path().to_path_buf(),
        "livecap-media",
        "http://127.0.0.1:8788/media",
    ));
    let index = Arc::new(MetadataIndex::open_in_memory("media_metadata").unwrap());
    let pipeline = IngestPipeline::new(
        Arc::new(PassEncoder),
        Arc::new(SilentTranscriber),
        store,
        Arc::clone(&index),
    );
    (pipeline, index)
}

/// Run a capture session for `run_for`, feeding `listener_rx` into the
/// driver, and collect every finalized clip it emitted.
async fn run_session(
    settings: CaptureSettings,
    listener_rx: mpsc::Receiver<livecap::capture::ListenerEvent>,
    run_for: Duration,
) -> Vec<FinalizedClip> {
    let source = Arc::new(SimulatedSource::new());
    let (segment_tx, mut segment_rx) = mpsc::channel(32);
    let mut controller = CaptureController::new(
        settings,
        source,
        segment_tx,
        DiagnosticsHandle::noop(),
    );
    controller.start().await.unwrap();

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let driver = tokio::spawn(drive(controller, listener_rx, shutdown_rx));

    tokio::time::sleep(run_for).await;
    shutdown_tx.send(()).await.unwrap();
    let controller = driver.await.unwrap();
    drop(controller);

    let mut clips = Vec::new();
    while let Some(clip) = segment_rx.recv().await {
        clips.push(clip);
    }
    clips
}

#[tokio::test]
async fn test_rolling_window_produces_full_window_records() {
    // Keep the listener channel open but silent for the whole run
    let (_listener_tx, listener_rx) = mpsc::channel(4);
    let clips = run_session(fast_settings(), listener_rx, Duration::from_millis(250)).await;

    assert!(!clips.is_empty(), "expected at least one rotated window");
    for clip in &clips {
        assert_eq!(clip.segment.clip_type, ClipType::LowRes);
        assert_eq!(clip.segment.reason, CloseReason::FullWindow);
        assert!(clip.segment.size_bytes() > 0);
    }

    // Names are sequential, so queue order mirrors capture order
    let names: Vec<&str> = clips.iter().map(|c| c.segment.name.as_str()).collect();
    for (i, name) in names.iter().enumerate() {
        assert_eq!(*name, format!("low-{:04}", i + 1));
    }

    // Every clip ingests into exactly one indexed record
    let session_id = clips[0].segment.session_id;
    let expected = clips.len() as u64;

    let queue_dir = TempDir::new().unwrap();
    let queue = UploadQueue::new(queue_dir.path().join("upload_queue.jsonl"));
    for clip in clips {
        let outcome = queue.enqueue(clip, &DiagnosticsHandle::noop()).await.unwrap();
        assert!(outcome.is_new());
    }

    let storage = TempDir::new().unwrap();
    let (pipeline, index) = test_pipeline(&storage);
    for job in queue.pending().await.unwrap() {
        pipeline.ingest(job.request).await.unwrap();
    }

    assert_eq!(index.count().unwrap(), expected);
    let records = index.records_for_session(session_id).unwrap();
    assert_eq!(records.len() as u64, expected);
    for record in records {
        assert_eq!(record.reason, CloseReason::FullWindow);
        assert!(record.size_bytes_encoded > 0);
    }
}

#[tokio::test]
async fn test_wake_word_clip_carries_transcript_into_record() {
    let settings = CaptureSettings {
        window: Duration::from_millis(120),
        trigger_clip: Duration::from_millis(40),
        ..CaptureSettings::default()
    };

    let recognizer = Arc::new(ScriptedRecognizer::single_session(&[
        "chopping the onions",
        "record now while searing chicken",
        "flip it and season well",
    ]));
    let listener = TriggerListener::new(recognizer, &settings).unwrap();
    let (listener_rx, handle) = listener.start().unwrap();

    let clips = run_session(settings, listener_rx, Duration::from_millis(300)).await;
    handle.stop().await.unwrap();

    let high: Vec<&FinalizedClip> = clips
        .iter()
        .filter(|c| c.segment.clip_type == ClipType::HighRes)
        .collect();
    assert_eq!(high.len(), 1, "one wake word, one high-res clip");
    assert_eq!(high[0].segment.reason, CloseReason::TriggerTimeout);
    assert!(high[0]
        .transcript_text
        .contains("record now while searing chicken"));

    // The wake phrase also lands inside the first full low-res window
    assert!(clips.iter().any(|c| {
        c.segment.clip_type == ClipType::LowRes
            && c.transcript_text.contains("record now while searing chicken")
    }));

    // Without a transcription credential the server keeps the client's
    // window text, and the receipt reports zero transcribed characters
    let queue_dir = TempDir::new().unwrap();
    let queue = UploadQueue::new(queue_dir.path().join("upload_queue.jsonl"));
    queue
        .enqueue(high[0].clone(), &DiagnosticsHandle::noop())
        .await
        .unwrap();

    let storage = TempDir::new().unwrap();
    let (pipeline, index) = test_pipeline(&storage);
    let job = queue.pending().await.unwrap().remove(0);
    let receipt = pipeline.ingest(job.request).await.unwrap();
    assert_eq!(receipt.transcript_chars, 0);

    let record = index.get(&receipt.document_id).unwrap().unwrap();
    assert_eq!(record.transcript.status, TranscribeStatus::NoCredential);
    assert!(record
        .transcript_text
        .contains("record now while searing chicken"));
}
