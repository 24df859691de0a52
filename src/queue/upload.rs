//! Durable upload queue for finalized clips.
//!
//! Append-only JSONL with state derived from replay: each state change is a
//! new line, and the current job set is rebuilt by replaying the log. A
//! single worker drains the queue strictly FIFO with one request in flight,
//! retrying with capped exponential backoff and quarantining jobs that
//! exhaust their attempts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::QueueSettings;
use crate::domain::{ClipSegment, ClipUploadRequest, FinalizedClip};

use super::diagnostics::{DiagEvent, DiagnosticsHandle};

/// Errors that can occur with the upload queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Retry schedule: `min(base * 2^(attempt-1), cap)`
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            base: settings.backoff_base,
            cap: settings.backoff_cap,
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Terminal state of an upload job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Succeeded,
    GivenUp,
}

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,

    /// The job id (dedup key)
    pub job_id: String,

    #[serde(flatten)]
    pub kind: QueueEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEventKind {
    /// Job added with its full serialized payload
    Enqueued { request: Box<ClipUploadRequest> },

    /// One submission attempt failed; retry scheduled
    AttemptFailed {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },

    /// Submission succeeded
    Succeeded { attempt: u32 },

    /// Attempts exhausted; moved to quarantine
    GivenUp { attempts: u32 },

    /// Quarantined job manually re-enqueued with a reset attempt counter
    Resubmitted,
}

/// A queue job with current state (derived from replaying events)
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Dedup key: truncated sha256 of session + clip name + window
    pub id: String,

    pub state: JobState,
    pub request: ClipUploadRequest,

    /// Number of completed attempts
    pub attempt: u32,

    /// Earliest time the next attempt may run
    pub next_attempt_at: DateTime<Utc>,

    /// FIFO position anchor
    pub enqueued_at: DateTime<Utc>,

    pub last_error: Option<String>,
}

/// Result of enqueueing a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(String),
    AlreadyQueued(String),
    AlreadyProcessed(String),
}

impl EnqueueOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Queued(id) | Self::AlreadyQueued(id) | Self::AlreadyProcessed(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Queue status summary
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub succeeded: usize,
    pub given_up: usize,
    pub recent: Vec<UploadJob>,
}

/// Compute the dedup key for one logical clip
pub fn dedup_key(segment: &ClipSegment) -> String {
    segment.dedup_key()
}

/// JSONL-backed upload queue
pub struct UploadQueue {
    queue_path: PathBuf,
}

impl UploadQueue {
    pub fn new(queue_path: PathBuf) -> Self {
        Self { queue_path }
    }

    /// Open the queue at the configured default location
    pub async fn open_default() -> Result<Self> {
        let path = crate::config::queue_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self::new(path))
    }

    async fn append_event(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.queue_path)
            .await?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Replay all events to build current state
    pub async fn replay(&self) -> Result<HashMap<String, UploadJob>, QueueError> {
        let mut jobs: HashMap<String, UploadJob> = HashMap::new();

        if !self.queue_path.exists() {
            return Ok(jobs);
        }

        let file = File::open(&self.queue_path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: QueueEvent = serde_json::from_str(&line)?;
            Self::apply_event(&mut jobs, event);
        }

        Ok(jobs)
    }

    fn apply_event(jobs: &mut HashMap<String, UploadJob>, event: QueueEvent) {
        match event.kind {
            QueueEventKind::Enqueued { request } => {
                jobs.insert(
                    event.job_id.clone(),
                    UploadJob {
                        id: event.job_id,
                        state: JobState::Pending,
                        request: *request,
                        attempt: 0,
                        next_attempt_at: event.timestamp,
                        enqueued_at: event.timestamp,
                        last_error: None,
                    },
                );
            }
            QueueEventKind::AttemptFailed {
                attempt,
                next_attempt_at,
                error,
            } => {
                if let Some(job) = jobs.get_mut(&event.job_id) {
                    job.attempt = attempt;
                    job.next_attempt_at = next_attempt_at;
                    job.last_error = Some(error);
                }
            }
            QueueEventKind::Succeeded { attempt } => {
                if let Some(job) = jobs.get_mut(&event.job_id) {
                    job.state = JobState::Succeeded;
                    job.attempt = attempt;
                }
            }
            QueueEventKind::GivenUp { attempts } => {
                if let Some(job) = jobs.get_mut(&event.job_id) {
                    job.state = JobState::GivenUp;
                    job.attempt = attempts;
                }
            }
            QueueEventKind::Resubmitted => {
                if let Some(job) = jobs.get_mut(&event.job_id) {
                    job.state = JobState::Pending;
                    job.attempt = 0;
                    job.last_error = None;
                    job.next_attempt_at = event.timestamp;
                    // Re-enters FIFO order at the tail
                    job.enqueued_at = event.timestamp;
                }
            }
        }
    }

    /// Serialize a finalized clip and append it as a pending job.
    ///
    /// The clip already carries the session transcript slice overlapping its
    /// window. Never performs network I/O. Ownership of the segment bytes
    /// transfers into the serialized payload.
    pub async fn enqueue(
        &self,
        clip: FinalizedClip,
        diagnostics: &DiagnosticsHandle,
    ) -> Result<EnqueueOutcome, QueueError> {
        let FinalizedClip {
            segment,
            transcript,
            transcript_text,
        } = clip;
        let key = dedup_key(&segment);

        let jobs = self.replay().await?;
        if let Some(existing) = jobs.get(&key) {
            return Ok(match existing.state {
                JobState::Succeeded => EnqueueOutcome::AlreadyProcessed(key),
                // Quarantined jobs re-enter only via manual resubmission
                _ => EnqueueOutcome::AlreadyQueued(key),
            });
        }

        let request = ClipUploadRequest {
            session_id: segment.session_id,
            clip_name: segment.name.clone(),
            clip_type: segment.clip_type,
            reason: segment.reason,
            mime_type: segment.mime_type.clone(),
            size_bytes: segment.size_bytes(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(&segment.bytes),
            captured_at: Utc::now(),
            clip_started_at: segment.started_at,
            clip_ended_at: segment.ended_at,
            transcript_full_text: transcript_text,
            transcript_entries: transcript.into_iter().map(Into::into).collect(),
        };

        let event = QueueEvent {
            timestamp: Utc::now(),
            job_id: key.clone(),
            kind: QueueEventKind::Enqueued {
                request: Box::new(request),
            },
        };
        self.append_event(&event).await?;

        diagnostics.emit(DiagEvent::Queued {
            job_id: key.clone(),
            clip_name: segment.name,
        });

        Ok(EnqueueOutcome::Queued(key))
    }

    /// Pending jobs in FIFO order
    pub async fn pending(&self) -> Result<Vec<UploadJob>, QueueError> {
        let jobs = self.replay().await?;
        let mut pending: Vec<UploadJob> = jobs
            .into_values()
            .filter(|j| j.state == JobState::Pending)
            .collect();
        pending.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(pending)
    }

    /// Quarantined jobs awaiting manual resubmission
    pub async fn quarantined(&self) -> Result<Vec<UploadJob>, QueueError> {
        let jobs = self.replay().await?;
        let mut failed: Vec<UploadJob> = jobs
            .into_values()
            .filter(|j| j.state == JobState::GivenUp)
            .collect();
        failed.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(failed)
    }

    pub async fn record_failure(
        &self,
        job_id: &str,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            kind: QueueEventKind::AttemptFailed {
                attempt,
                next_attempt_at,
                error: error.to_string(),
            },
        })
        .await
    }

    pub async fn record_success(&self, job_id: &str, attempt: u32) -> Result<(), QueueError> {
        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            kind: QueueEventKind::Succeeded { attempt },
        })
        .await
    }

    pub async fn record_given_up(&self, job_id: &str, attempts: u32) -> Result<(), QueueError> {
        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            kind: QueueEventKind::GivenUp { attempts },
        })
        .await
    }

    /// Re-enqueue one quarantined job with a reset attempt counter
    pub async fn resubmit(&self, job_id: &str) -> Result<(), QueueError> {
        let jobs = self.replay().await?;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if job.state != JobState::GivenUp {
            return Err(QueueError::NotFound(format!(
                "{} is not quarantined",
                job_id
            )));
        }

        self.append_event(&QueueEvent {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            kind: QueueEventKind::Resubmitted,
        })
        .await
    }

    /// Re-enqueue all quarantined jobs; returns how many were resubmitted
    pub async fn resubmit_all(
        &self,
        diagnostics: &DiagnosticsHandle,
    ) -> Result<usize, QueueError> {
        let failed = self.quarantined().await?;
        for job in &failed {
            self.resubmit(&job.id).await?;
            diagnostics.emit(DiagEvent::Resubmitted {
                job_id: job.id.clone(),
            });
        }
        Ok(failed.len())
    }

    /// Queue status summary
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let jobs = self.replay().await?;

        let mut status = QueueStatus::default();
        for job in jobs.values() {
            match job.state {
                JobState::Pending => status.pending += 1,
                JobState::Succeeded => status.succeeded += 1,
                JobState::GivenUp => status.given_up += 1,
            }
        }

        let mut all: Vec<&UploadJob> = jobs.values().collect();
        all.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        status.recent = all.into_iter().take(5).cloned().collect();

        Ok(status)
    }
}
