//! Capture session and transcript timeline.
//!
//! A session is one capture run. It exists only on the client: the server
//! never persists a session as a single entity, it only sees the transcript
//! slices attached to individual clips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a transcript entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    /// Produced by the speech recognizer
    Recognized,

    /// Injected for testing or demo purposes
    Simulated,
}

/// One entry in the rolling transcript timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Recognized or injected text
    pub text: String,

    /// Where the text came from
    pub source: TranscriptSource,

    /// When the entry was received
    pub received_at: DateTime<Utc>,

    /// Elapsed time since session start, formatted "mm:ss"
    pub elapsed_label: String,
}

/// One capture run. Created when capture starts, reset on restart.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque, process-local identifier
    pub id: Uuid,

    /// When capture started
    pub started_at: DateTime<Utc>,

    /// Ordered transcript timeline
    pub transcript: Vec<TranscriptEntry>,
}

impl Session {
    /// Start a new session
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            transcript: Vec::new(),
        }
    }

    /// Append a transcript entry, stamping it with the elapsed label
    pub fn push_transcript(&mut self, text: impl Into<String>, source: TranscriptSource) {
        let now = Utc::now();
        self.transcript.push(TranscriptEntry {
            text: text.into(),
            source,
            received_at: now,
            elapsed_label: elapsed_label(self.started_at, now),
        });
    }

    /// Entries whose timestamps overlap the given window.
    ///
    /// Used to attach the relevant transcript slice to a finalized clip.
    pub fn transcript_slice(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Vec<TranscriptEntry> {
        self.transcript
            .iter()
            .filter(|e| e.received_at >= window_start && e.received_at <= window_end)
            .cloned()
            .collect()
    }

    /// Concatenated transcript text for a window
    pub fn transcript_text(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> String {
        self.transcript_slice(window_start, window_end)
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reset the session for a capture restart (new id, cleared timeline)
    pub fn reset(&mut self) {
        *self = Self::start();
    }
}

/// A finalized segment paired with the session transcript slice
/// overlapping its window. This is what crosses from the capture
/// controller into the upload queue.
#[derive(Debug, Clone)]
pub struct FinalizedClip {
    pub segment: super::clip::ClipSegment,
    pub transcript: Vec<TranscriptEntry>,
    pub transcript_text: String,
}

impl FinalizedClip {
    pub fn annotate(segment: super::clip::ClipSegment, session: &Session) -> Self {
        Self::annotate_with_lead(segment, session, chrono::Duration::zero())
    }

    /// Like `annotate`, but the slice starts `lead` before the segment.
    ///
    /// Used for trigger clips: the utterance that triggered the clip is
    /// recognized just before the recorder starts and belongs with it.
    pub fn annotate_with_lead(
        segment: super::clip::ClipSegment,
        session: &Session,
        lead: chrono::Duration,
    ) -> Self {
        let slice_start = segment.started_at - lead;
        let transcript = session.transcript_slice(slice_start, segment.ended_at);
        let transcript_text = session.transcript_text(slice_start, segment.ended_at);
        Self {
            segment,
            transcript,
            transcript_text,
        }
    }
}

/// Format elapsed time since `start` as "mm:ss"
pub fn elapsed_label(start: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - start).num_seconds().max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
