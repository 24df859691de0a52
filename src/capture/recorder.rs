//! Media source and recorder abstractions.
//!
//! The capture controller never talks to platform capture APIs directly.
//! It opens streams through the `MediaSource` trait and records through
//! fresh `Recorder` instances, one per window, so each finalized blob is an
//! independently decodable container. Device handles are held by a
//! `StreamGuard` that releases them on every exit path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of probing a platform capability before use.
///
/// Callers branch on this instead of catching errors from a failed start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable { reason: String },
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }
}

/// Errors opening a capture stream
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device permission denied")]
    PermissionDenied,

    #[error("Capture constraints not satisfiable: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("Capture device unavailable: {0}")]
    Unavailable(String),
}

/// Requested stream characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio: bool,

    /// Whether the profile may be relaxed if exact constraints fail
    pub exact: bool,
}

impl StreamProfile {
    /// Continuous background capture profile
    pub fn low_res() -> Self {
        Self {
            width: 640,
            height: 360,
            frame_rate: 10,
            audio: true,
            exact: true,
        }
    }

    /// On-demand trigger capture profile
    pub fn high_res() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 30,
            audio: true,
            exact: true,
        }
    }

    /// Relaxed variant used as a fallback when exact constraints fail
    pub fn relaxed(mut self) -> Self {
        self.exact = false;
        self
    }
}

/// Which audio track feeds a recorder.
///
/// The controller prefers the low-res stream's already-open track over
/// opening a second audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRouting {
    /// Borrow the low-res stream's live audio track
    BorrowedLowRes,

    /// Use the recording stream's own audio track
    OwnTrack,

    /// No live audio track available
    None,
}

/// A finalized recording produced by a stopped recorder
#[derive(Debug, Clone)]
pub struct RecordedBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One recorder instance. Created per window, stopped exactly once.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Stop recording and hand back the finalized blob
    async fn stop(self: Box<Self>) -> RecordedBlob;
}

/// An open capture stream holding device handles
pub trait MediaStream: Send + Sync {
    /// Whether this stream has a live audio track
    fn has_live_audio(&self) -> bool;

    /// Start a fresh recorder on this stream
    fn start_recorder(&self, mime_type: &str, audio: AudioRouting) -> Box<dyn Recorder>;

    /// Release the underlying device handles (idempotent)
    fn release(&self);
}

/// A source of capture streams (camera + microphone, or a test double)
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Probe whether this source can capture at all
    fn probe(&self) -> Capability;

    /// Open a stream with the given profile
    async fn open(&self, profile: StreamProfile) -> Result<Box<dyn MediaStream>, DeviceError>;
}

/// Owns an open stream and guarantees release when dropped
pub struct StreamGuard {
    stream: Box<dyn MediaStream>,
}

impl StreamGuard {
    pub fn new(stream: Box<dyn MediaStream>) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &dyn MediaStream {
        self.stream.as_ref()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stream.release();
    }
}

/// Open a stream, retrying once with relaxed constraints.
///
/// Permission denial is never retried; only unsatisfiable exact constraints
/// fall back. Handles from a failed exact attempt are released by the source
/// before the error is returned.
pub async fn open_with_fallback(
    source: &dyn MediaSource,
    profile: StreamProfile,
) -> Result<StreamGuard, DeviceError> {
    match source.open(profile).await {
        Ok(stream) => Ok(StreamGuard::new(stream)),
        Err(DeviceError::ConstraintsUnsatisfiable(detail)) if profile.exact => {
            tracing::warn!(%detail, "Exact capture constraints failed, retrying relaxed");
            let stream = source.open(profile.relaxed()).await?;
            Ok(StreamGuard::new(stream))
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Simulated source (tests, demo capture without devices)
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Simulated capture source producing deterministic bytes.
///
/// Byte output is proportional to recording duration, so segment-validity
/// checks behave the same way they would with a real recorder.
pub struct SimulatedSource {
    /// Bytes produced per millisecond of recording
    bytes_per_ms: usize,

    /// Whether streams report a live audio track
    with_audio: bool,

    /// Fail every open with this error kind (for device-error tests)
    deny: Option<SimulatedDenial>,

    open_streams: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedDenial {
    Permission,
    Constraints,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self {
            bytes_per_ms: 16,
            with_audio: true,
            deny: None,
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn without_audio(mut self) -> Self {
        self.with_audio = false;
        self
    }

    pub fn denying(mut self, denial: SimulatedDenial) -> Self {
        self.deny = Some(denial);
        self
    }

    /// Number of streams currently holding device handles
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SimulatedSource {
    fn probe(&self) -> Capability {
        Capability::Available
    }

    async fn open(&self, profile: StreamProfile) -> Result<Box<dyn MediaStream>, DeviceError> {
        match self.deny {
            Some(SimulatedDenial::Permission) => return Err(DeviceError::PermissionDenied),
            Some(SimulatedDenial::Constraints) if profile.exact => {
                return Err(DeviceError::ConstraintsUnsatisfiable(format!(
                    "{}x{}@{} not supported",
                    profile.width, profile.height, profile.frame_rate
                )))
            }
            _ => {}
        }

        self.open_streams.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SimulatedStream {
            bytes_per_ms: self.bytes_per_ms,
            with_audio: self.with_audio && profile.audio,
            released: AtomicBool::new(false),
            open_streams: Arc::clone(&self.open_streams),
        }))
    }
}

struct SimulatedStream {
    bytes_per_ms: usize,
    with_audio: bool,
    released: AtomicBool,
    open_streams: Arc<AtomicUsize>,
}

impl MediaStream for SimulatedStream {
    fn has_live_audio(&self) -> bool {
        self.with_audio
    }

    fn start_recorder(&self, mime_type: &str, _audio: AudioRouting) -> Box<dyn Recorder> {
        Box::new(SimulatedRecorder {
            bytes_per_ms: self.bytes_per_ms,
            mime_type: mime_type.to_string(),
            started_at: Utc::now(),
        })
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct SimulatedRecorder {
    bytes_per_ms: usize,
    mime_type: String,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl Recorder for SimulatedRecorder {
    async fn stop(self: Box<Self>) -> RecordedBlob {
        let ended_at = Utc::now();
        let elapsed_ms = (ended_at - self.started_at).num_milliseconds().max(1) as usize;

        RecordedBlob {
            bytes: vec![0xAB; elapsed_ms * self.bytes_per_ms],
            mime_type: self.mime_type,
            started_at: self.started_at,
            ended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_simulated_recorder_output_grows_with_time() {
        let source = SimulatedSource::new();
        let guard = open_with_fallback(&source, StreamProfile::low_res())
            .await
            .unwrap();

        let recorder = guard
            .stream()
            .start_recorder("video/webm", AudioRouting::OwnTrack);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let blob = recorder.stop().await;

        assert!(!blob.bytes.is_empty());
        assert_eq!(blob.mime_type, "video/webm");
        assert!(blob.ended_at > blob.started_at);
    }

    #[tokio::test]
    async fn test_guard_releases_handles_on_drop() {
        let source = SimulatedSource::new();
        {
            let _guard = open_with_fallback(&source, StreamProfile::low_res())
                .await
                .unwrap();
            assert_eq!(source.open_stream_count(), 1);
        }
        assert_eq!(source.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let source = SimulatedSource::new().denying(SimulatedDenial::Permission);
        let result = open_with_fallback(&source, StreamProfile::low_res()).await;
        assert!(matches!(result, Err(DeviceError::PermissionDenied)));
        assert_eq!(source.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_constraint_failure_falls_back_to_relaxed() {
        // Denial only applies to exact profiles, so the relaxed retry succeeds
        let source = SimulatedSource::new().denying(SimulatedDenial::Constraints);
        let guard = open_with_fallback(&source, StreamProfile::high_res()).await;
        assert!(guard.is_ok());
        drop(guard);
        assert_eq!(source.open_stream_count(), 0);
    }
}
