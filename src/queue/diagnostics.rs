//! Best-effort diagnostics sink.
//!
//! Queue transitions and capture anomalies are reported through a bounded
//! channel to a detached relay task. Emission never blocks and never fails
//! the upload path: when the channel is full the event is dropped.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A diagnostics event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagEvent {
    /// A segment entered the upload queue
    Queued { job_id: String, clip_name: String },

    /// The worker started a submission attempt
    AttemptStarted { job_id: String, attempt: u32 },

    /// An attempt failed and a retry was scheduled
    RetryScheduled {
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// The job exhausted its attempts and was quarantined
    GaveUp { job_id: String, attempts: u32 },

    /// The job was ingested successfully
    Succeeded { job_id: String, attempt: u32 },

    /// A quarantined job was manually resubmitted
    Resubmitted { job_id: String },

    /// A segment failed the queue-eligibility rule and was discarded
    SegmentDiscarded {
        clip_name: String,
        reason: String,
        duration_ms: u64,
    },

    /// A wake trigger was suppressed by the cooldown window
    TriggerSuppressed { text: String },
}

/// Cloneable, non-blocking handle for emitting diagnostics
#[derive(Clone)]
pub struct DiagnosticsHandle {
    tx: Option<mpsc::Sender<DiagEvent>>,
}

impl DiagnosticsHandle {
    /// A handle that discards everything
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Never blocks; drops the event if the relay is behind.
    pub fn emit(&self, event: DiagEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                tracing::trace!("Diagnostics channel full, event dropped");
            }
        }
    }
}

/// Spawn the relay task: log every event, and if a relay URL is configured,
/// POST it fire-and-forget. Relay failures are invisible to callers.
pub fn spawn_relay(relay_url: Option<String>) -> DiagnosticsHandle {
    let (tx, mut rx) = mpsc::channel::<DiagEvent>(256);

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(event) = rx.recv().await {
            tracing::debug!(event = ?event, "diagnostics");

            if let Some(url) = &relay_url {
                let _ = client.post(url).json(&event).send().await;
            }
        }
    });

    DiagnosticsHandle { tx: Some(tx) }
}

/// Collecting sink for tests: events land in the returned vec
pub fn collector() -> (DiagnosticsHandle, Arc<Mutex<Vec<DiagEvent>>>) {
    let (tx, mut rx) = mpsc::channel::<DiagEvent>(256);
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&events);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            sink.lock().unwrap().push(event);
        }
    });

    (DiagnosticsHandle { tx: Some(tx) }, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collector_receives_events() {
        let (handle, events) = collector();

        handle.emit(DiagEvent::Queued {
            job_id: "abc".to_string(),
            clip_name: "low-0001".to_string(),
        });
        handle.emit(DiagEvent::Succeeded {
            job_id: "abc".to_string(),
            attempt: 1,
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_noop_handle_never_panics() {
        let handle = DiagnosticsHandle::noop();
        handle.emit(DiagEvent::TriggerSuppressed {
            text: "record".to_string(),
        });
    }

    #[test]
    fn test_event_wire_shape() {
        let event = DiagEvent::RetryScheduled {
            job_id: "j1".to_string(),
            attempt: 2,
            delay_ms: 6000,
            error: "timeout".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json.get("event").unwrap(), "retry_scheduled");
        assert_eq!(json.get("delay_ms").unwrap(), 6000);
    }
}
