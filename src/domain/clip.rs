//! Finalized clip segments and the queue-eligibility rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Fidelity of a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClipType {
    /// Continuous low-resolution background capture
    LowRes,

    /// Short high-resolution capture triggered on demand
    HighRes,
}

impl ClipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowRes => "low-res",
            Self::HighRes => "high-res",
        }
    }
}

/// Why a recorder instance was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The rolling window elapsed and the recorder rotated
    FullWindow,

    /// Capture was stopped explicitly mid-segment
    Stop,

    /// A wake trigger's fixed duration elapsed
    TriggerTimeout,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullWindow => "full_window",
            Self::Stop => "stop",
            Self::TriggerTimeout => "trigger_timeout",
        }
    }
}

/// A finalized, immutable recording unit.
///
/// Created by the capture controller when a recorder stops; ownership
/// transfers to the upload queue on enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipSegment {
    /// Session this clip belongs to
    pub session_id: Uuid,

    /// Clip name, unique within the session (e.g. "low-0007")
    pub name: String,

    /// Fidelity of the originating stream
    pub clip_type: ClipType,

    /// Why the recorder closed
    pub reason: CloseReason,

    /// When recording of this segment started
    pub started_at: DateTime<Utc>,

    /// When the recorder stopped
    pub ended_at: DateTime<Utc>,

    /// Raw container bytes
    pub bytes: Vec<u8>,

    /// Declared mime type (e.g. "video/webm")
    pub mime_type: String,
}

impl ClipSegment {
    /// Measured duration of the segment
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Dedup key identifying this logical clip across retries.
    ///
    /// Computed from the session, clip name, and time window, so a retried
    /// upload of the same clip always carries the same key. The server dedups
    /// on it when a successful call went unacknowledged.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.session_id, &self.name, self.started_at, self.ended_at)
    }

    /// Whether this segment may enter the upload queue.
    ///
    /// Low-res segments are queued only when they closed because the rolling
    /// window filled AND the measured duration covers the configured window;
    /// anything shorter is a truncated tail and is discarded. High-res
    /// segments are always queued.
    pub fn queue_eligible(&self, window: Duration) -> bool {
        match self.clip_type {
            ClipType::HighRes => true,
            ClipType::LowRes => {
                self.reason == CloseReason::FullWindow && self.duration() >= window
            }
        }
    }
}

/// Truncated SHA-256 over session id, clip name, and time window.
///
/// Shared by the upload queue (job id) and the ingestion endpoint
/// (server-side dedup).
pub fn dedup_key(
    session_id: Uuid,
    clip_name: &str,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(session_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(clip_name.as_bytes());
    hasher.update(b":");
    hasher.update(started_at.to_rfc3339().as_bytes());
    hasher.update(b":");
    hasher.update(ended_at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}
