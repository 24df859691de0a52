//! Segmented capture controller.
//!
//! Owns the two capture streams for one session. The low-res stream rotates
//! a fresh recorder every window so each emitted blob is an independently
//! decodable container, never a byte slice of a longer stream. The high-res
//! stream records fixed-duration clips on wake or manual trigger.
//!
//! One controller instance per session, constructed and passed explicitly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CaptureSettings;
use crate::domain::{ClipSegment, ClipType, CloseReason, FinalizedClip, Session, TranscriptSource};
use crate::queue::diagnostics::{DiagEvent, DiagnosticsHandle};

use super::listener::ListenerEvent;
use super::recorder::{
    open_with_fallback, AudioRouting, DeviceError, MediaSource, Recorder, StreamGuard,
    StreamProfile,
};

/// Allowance for timer jitter when checking measured segment duration
/// against the configured window.
const WINDOW_SLACK: Duration = Duration::from_millis(150);

/// Why a high-res trigger did or did not start a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,

    /// A high-res clip is already recording
    IgnoredAlreadyRecording,

    /// High-res capture is derived from the low-res stream; without an
    /// active low-res stream the trigger is ignored
    IgnoredInactive,
}

/// What caused a high-res trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    WakeWord,
    Manual,
}

struct LowStream {
    guard: StreamGuard,
    recorder: Option<Box<dyn Recorder>>,
    deadline: Instant,
}

struct HighStream {
    guard: StreamGuard,
    recorder: Option<Box<dyn Recorder>>,
    deadline: Instant,
}

/// Capture controller for one session
pub struct CaptureController {
    settings: CaptureSettings,
    source: Arc<dyn MediaSource>,
    segment_tx: mpsc::Sender<FinalizedClip>,
    diagnostics: DiagnosticsHandle,

    session: Session,
    low: Option<LowStream>,
    high: Option<HighStream>,
    low_seq: u32,
    high_seq: u32,
    mime_type: String,
}

impl CaptureController {
    pub fn new(
        settings: CaptureSettings,
        source: Arc<dyn MediaSource>,
        segment_tx: mpsc::Sender<FinalizedClip>,
        diagnostics: DiagnosticsHandle,
    ) -> Self {
        Self {
            settings,
            source,
            segment_tx,
            diagnostics,
            session: Session::start(),
            low: None,
            high: None,
            low_seq: 0,
            high_seq: 0,
            mime_type: "video/webm".to_string(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn is_active(&self) -> bool {
        self.low.is_some()
    }

    pub fn is_high_recording(&self) -> bool {
        self.high.is_some()
    }

    /// Start continuous low-res capture. Resets the session.
    ///
    /// Device handles acquired here are released on stop and on every
    /// failure path inside `open_with_fallback`.
    pub async fn start(&mut self) -> Result<(), DeviceError> {
        if self.low.is_some() {
            return Ok(());
        }

        let guard = open_with_fallback(self.source.as_ref(), StreamProfile::low_res()).await?;

        self.session.reset();
        self.low_seq = 0;
        self.high_seq = 0;

        let recorder = guard
            .stream()
            .start_recorder(&self.mime_type, AudioRouting::OwnTrack);

        self.low = Some(LowStream {
            guard,
            recorder: Some(recorder),
            deadline: Instant::now() + self.settings.window,
        });

        info!(session_id = %self.session.id, "Capture started");
        Ok(())
    }

    /// Stop all capture. The in-progress low-res segment closes with reason
    /// "stop" and is discarded by the eligibility rule; an in-progress
    /// high-res clip is finalized and queued.
    pub async fn stop(&mut self) {
        if self.high.is_some() {
            self.finish_high(CloseReason::Stop).await;
        }

        if let Some(mut low) = self.low.take() {
            if let Some(recorder) = low.recorder.take() {
                let blob = recorder.stop().await;
                self.dispatch_low(blob, CloseReason::Stop).await;
            }
            // Dropping the guard releases the device handles
        }

        info!(session_id = %self.session.id, "Capture stopped");
    }

    /// Close the current low-res window and start a fresh recorder.
    pub async fn rotate_low(&mut self) {
        let Some(low) = self.low.as_mut() else {
            return;
        };

        let Some(recorder) = low.recorder.take() else {
            return;
        };

        let blob = recorder.stop().await;

        // Fresh recorder instance per window, never a long-lived one
        let next = low
            .guard
            .stream()
            .start_recorder(&self.mime_type, AudioRouting::OwnTrack);
        low.recorder = Some(next);
        low.deadline = Instant::now() + self.settings.window;

        self.dispatch_low(blob, CloseReason::FullWindow).await;
    }

    /// Start a high-res clip. Ignored while one is recording or when the
    /// low-res stream is not active.
    pub async fn trigger_high(&mut self, origin: TriggerOrigin) -> Result<TriggerOutcome, DeviceError> {
        if self.high.is_some() {
            debug!(?origin, "High-res trigger ignored: already recording");
            return Ok(TriggerOutcome::IgnoredAlreadyRecording);
        }
        let Some(low) = self.low.as_ref() else {
            debug!(?origin, "High-res trigger ignored: capture inactive");
            return Ok(TriggerOutcome::IgnoredInactive);
        };

        let guard = open_with_fallback(self.source.as_ref(), StreamProfile::high_res()).await?;

        // Prefer the low-res stream's already-open audio track over a second
        // audio device; fall back to the high-res stream's own, then none.
        let audio = if low.guard.stream().has_live_audio() {
            AudioRouting::BorrowedLowRes
        } else if guard.stream().has_live_audio() {
            AudioRouting::OwnTrack
        } else {
            AudioRouting::None
        };

        debug!(?origin, ?audio, "High-res capture starting");

        let recorder = guard.stream().start_recorder(&self.mime_type, audio);
        self.high = Some(HighStream {
            guard,
            recorder: Some(recorder),
            deadline: Instant::now() + self.settings.trigger_clip,
        });

        Ok(TriggerOutcome::Started)
    }

    /// Finalize the high-res clip and release its stream.
    pub async fn finish_high(&mut self, reason: CloseReason) {
        let Some(mut high) = self.high.take() else {
            return;
        };
        let Some(recorder) = high.recorder.take() else {
            return;
        };

        let blob = recorder.stop().await;
        drop(high.guard);

        self.high_seq += 1;
        let segment = ClipSegment {
            session_id: self.session.id,
            name: format!("high-{:04}", self.high_seq),
            clip_type: ClipType::HighRes,
            reason,
            started_at: blob.started_at,
            ended_at: blob.ended_at,
            bytes: blob.bytes,
            mime_type: blob.mime_type,
        };

        info!(
            clip = %segment.name,
            size_bytes = segment.size_bytes(),
            "High-res clip finalized"
        );

        // The triggering utterance is recognized just before the recorder
        // starts; lead the transcript slice by the wake cooldown so it is
        // attached to the clip. The cooldown bounds the lead to one trigger.
        let lead = chrono::Duration::from_std(self.settings.wake_cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let clip = FinalizedClip::annotate_with_lead(segment, &self.session, lead);
        if self.segment_tx.send(clip).await.is_err() {
            warn!("Segment receiver dropped; high-res clip lost");
        }
    }

    /// Next timer the driver loop should wake on
    pub fn next_deadline(&self) -> Option<(Instant, DeadlineKind)> {
        let low = self.low.as_ref().map(|l| (l.deadline, DeadlineKind::LowWindow));
        let high = self
            .high
            .as_ref()
            .map(|h| (h.deadline, DeadlineKind::HighClip));

        match (low, high) {
            (Some(l), Some(h)) => Some(if h.0 <= l.0 { h } else { l }),
            (Some(l), None) => Some(l),
            (None, Some(h)) => Some(h),
            (None, None) => None,
        }
    }

    /// Apply one listener event
    pub async fn handle_listener_event(&mut self, event: ListenerEvent) -> Result<(), DeviceError> {
        match event {
            ListenerEvent::Transcript { text } => {
                self.session.push_transcript(text, TranscriptSource::Recognized);
            }
            ListenerEvent::WakeDetected { .. } => {
                self.trigger_high(TriggerOrigin::WakeWord).await?;
            }
            ListenerEvent::StopDetected { .. } => {
                self.stop().await;
            }
            ListenerEvent::WakeSuppressed { text } => {
                self.diagnostics.emit(DiagEvent::TriggerSuppressed { text });
            }
            ListenerEvent::Restarting { reason } => {
                debug!(%reason, "Speech listener restarting");
            }
        }
        Ok(())
    }

    async fn dispatch_low(&mut self, blob: super::recorder::RecordedBlob, reason: CloseReason) {
        self.low_seq += 1;
        let segment = ClipSegment {
            session_id: self.session.id,
            name: format!("low-{:04}", self.low_seq),
            clip_type: ClipType::LowRes,
            reason,
            started_at: blob.started_at,
            ended_at: blob.ended_at,
            bytes: blob.bytes,
            mime_type: blob.mime_type,
        };

        let effective_window = self.settings.window.saturating_sub(WINDOW_SLACK);
        if !segment.queue_eligible(effective_window) {
            debug!(
                clip = %segment.name,
                reason = segment.reason.as_str(),
                duration_ms = segment.duration().as_millis() as u64,
                "Low-res segment discarded"
            );
            let duration_ms = segment.duration().as_millis() as u64;
            self.diagnostics.emit(DiagEvent::SegmentDiscarded {
                clip_name: segment.name,
                reason: segment.reason.as_str().to_string(),
                duration_ms,
            });
            return;
        }

        debug!(
            clip = %segment.name,
            size_bytes = segment.size_bytes(),
            "Low-res segment finalized"
        );

        let clip = FinalizedClip::annotate(segment, &self.session);
        if self.segment_tx.send(clip).await.is_err() {
            warn!("Segment receiver dropped; low-res segment lost");
        }
    }
}

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    LowWindow,
    HighClip,
}

/// Drive a controller until the shutdown signal fires.
///
/// This is the client's cooperative event loop: listener events and the two
/// capture timers are multiplexed on one task, so the controller itself
/// needs no internal locking.
pub async fn drive(
    mut controller: CaptureController,
    mut listener_events: mpsc::Receiver<ListenerEvent>,
    mut shutdown: mpsc::Receiver<()>,
) -> CaptureController {
    loop {
        let deadline = controller.next_deadline();

        tokio::select! {
            _ = shutdown.recv() => {
                controller.stop().await;
                break;
            }
            event = listener_events.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = controller.handle_listener_event(event).await {
                            warn!(error = %e, "Device error while handling listener event");
                        }
                    }
                    None => {
                        controller.stop().await;
                        break;
                    }
                }
            }
            _ = async {
                match deadline {
                    Some((at, _)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                match deadline {
                    Some((_, DeadlineKind::LowWindow)) => controller.rotate_low().await,
                    Some((_, DeadlineKind::HighClip)) => {
                        controller.finish_high(CloseReason::TriggerTimeout).await
                    }
                    None => {}
                }
            }
        }
    }

    controller
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::recorder::{SimulatedDenial, SimulatedSource};
    use crate::queue::diagnostics;

    fn fast_settings() -> CaptureSettings {
        CaptureSettings {
            window: Duration::from_millis(80),
            trigger_clip: Duration::from_millis(40),
            ..CaptureSettings::default()
        }
    }

    fn controller_with(
        source: Arc<SimulatedSource>,
        settings: CaptureSettings,
    ) -> (
        CaptureController,
        mpsc::Receiver<FinalizedClip>,
        DiagnosticsHandle,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (diag, _events) = diagnostics::collector();
        let controller = CaptureController::new(settings, source, tx, diag.clone());
        (controller, rx, diag)
    }

    #[tokio::test]
    async fn test_full_window_rotation_queues_segment() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, mut rx, _) = controller_with(Arc::clone(&source), fast_settings());

        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.rotate_low().await;

        let clip = rx.try_recv().expect("full window segment should be queued");
        assert_eq!(clip.segment.clip_type, ClipType::LowRes);
        assert_eq!(clip.segment.reason, CloseReason::FullWindow);
        assert!(clip.segment.size_bytes() > 0);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_discards_partial_low_segment() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, mut rx, _) = controller_with(Arc::clone(&source), fast_settings());

        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.stop().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(source.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_ignored_when_inactive() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, _rx, _) = controller_with(source, fast_settings());

        let outcome = controller.trigger_high(TriggerOrigin::Manual).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::IgnoredInactive);
    }

    #[tokio::test]
    async fn test_trigger_ignored_while_recording() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, _rx, _) = controller_with(source, fast_settings());

        controller.start().await.unwrap();
        let first = controller.trigger_high(TriggerOrigin::WakeWord).await.unwrap();
        assert_eq!(first, TriggerOutcome::Started);

        let second = controller.trigger_high(TriggerOrigin::WakeWord).await.unwrap();
        assert_eq!(second, TriggerOutcome::IgnoredAlreadyRecording);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_high_res_clip_always_queued() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, mut rx, _) = controller_with(Arc::clone(&source), fast_settings());

        controller.start().await.unwrap();
        controller.trigger_high(TriggerOrigin::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.finish_high(CloseReason::TriggerTimeout).await;

        let clip = rx.try_recv().expect("high-res clip should be queued");
        assert_eq!(clip.segment.clip_type, ClipType::HighRes);
        assert_eq!(clip.segment.reason, CloseReason::TriggerTimeout);
        assert_eq!(clip.segment.name, "high-0001");

        // High-res stream released, low-res still open
        assert_eq!(source.open_stream_count(), 1);
        controller.stop().await;
        assert_eq!(source.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_high_res_clip_carries_trigger_utterance() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, mut rx, _) = controller_with(source, fast_settings());

        controller.start().await.unwrap();
        controller
            .handle_listener_event(ListenerEvent::Transcript {
                text: "record now while searing chicken".to_string(),
            })
            .await
            .unwrap();
        controller
            .handle_listener_event(ListenerEvent::WakeDetected {
                text: "record now while searing chicken".to_string(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.finish_high(CloseReason::TriggerTimeout).await;

        let clip = rx.try_recv().expect("high-res clip should be queued");
        assert!(clip
            .transcript_text
            .contains("record now while searing chicken"));

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_controller_idle() {
        let source = Arc::new(SimulatedSource::new().denying(SimulatedDenial::Permission));
        let (mut controller, _rx, _) = controller_with(source, fast_settings());

        let result = controller.start().await;
        assert!(matches!(result, Err(DeviceError::PermissionDenied)));
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn test_drive_rotates_on_window_deadline() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, mut rx, _) = controller_with(source, fast_settings());
        controller.start().await.unwrap();

        let (_listener_tx, listener_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let driver = tokio::spawn(drive(controller, listener_rx, shutdown_rx));

        // Wait past two windows, then shut down
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).await.unwrap();
        driver.await.unwrap();

        let mut full_windows = 0;
        while let Ok(clip) = rx.try_recv() {
            if clip.segment.reason == CloseReason::FullWindow {
                full_windows += 1;
            }
        }
        assert!(full_windows >= 1);
    }

    #[tokio::test]
    async fn test_drive_finishes_high_clip_on_deadline() {
        let source = Arc::new(SimulatedSource::new());
        let (mut controller, mut rx, _) = controller_with(source, fast_settings());
        controller.start().await.unwrap();

        let (listener_tx, listener_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let driver = tokio::spawn(drive(controller, listener_rx, shutdown_rx));

        listener_tx
            .send(ListenerEvent::WakeDetected {
                text: "record now".to_string(),
            })
            .await
            .unwrap();

        // The 40ms high-res deadline fires well before the 80ms window
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(()).await.unwrap();
        driver.await.unwrap();

        let mut high_clips = 0;
        while let Ok(clip) = rx.try_recv() {
            if clip.segment.clip_type == ClipType::HighRes {
                assert_eq!(clip.segment.reason, CloseReason::TriggerTimeout);
                high_clips += 1;
            }
        }
        assert_eq!(high_clips, 1);
    }
}
