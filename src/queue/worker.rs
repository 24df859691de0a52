//! Single-consumer upload worker.
//!
//! Drains the queue strictly head-first with at most one request in flight.
//! A failing head job backs off in place rather than being reordered, so
//! clips always arrive at the ingest endpoint in capture order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::QueueSettings;
use crate::domain::{ClipUploadReceipt, ClipUploadRequest};

use super::diagnostics::{DiagEvent, DiagnosticsHandle};
use super::upload::{BackoffPolicy, QueueError, UploadQueue};

/// Poll interval while the queue is empty
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Errors from a single submission attempt
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// One clip submission to the ingest endpoint
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, request: &ClipUploadRequest) -> Result<ClipUploadReceipt, SubmitError>;
}

/// HTTP submitter posting to the configured ingest endpoint
pub struct HttpSubmitter {
    client: reqwest::Client,
    ingest_url: String,
}

impl HttpSubmitter {
    pub fn new(settings: &QueueSettings) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            client,
            ingest_url: settings.ingest_url.clone(),
        })
    }
}

#[async_trait]
impl Submitter for HttpSubmitter {
    async fn submit(&self, request: &ClipUploadRequest) -> Result<ClipUploadReceipt, SubmitError> {
        let response = self
            .client
            .post(&self.ingest_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = body.chars().take(300).collect();
            return Err(SubmitError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<(), QueueError>>,
}

impl WorkerHandle {
    pub async fn stop(self) -> Result<(), QueueError> {
        let _ = self.stop_tx.send(()).await;
        self.task.await.unwrap_or(Ok(()))
    }
}

/// Spawn the upload worker
pub fn spawn_worker(
    queue: Arc<UploadQueue>,
    submitter: Arc<dyn Submitter>,
    policy: BackoffPolicy,
    diagnostics: DiagnosticsHandle,
) -> WorkerHandle {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let task = tokio::spawn(run_worker(queue, submitter, policy, diagnostics, stop_rx));
    WorkerHandle { stop_tx, task }
}

async fn run_worker(
    queue: Arc<UploadQueue>,
    submitter: Arc<dyn Submitter>,
    policy: BackoffPolicy,
    diagnostics: DiagnosticsHandle,
    mut stop_rx: mpsc::Receiver<()>,
) -> Result<(), QueueError> {
    loop {
        let pending = queue.pending().await?;

        let Some(head) = pending.into_iter().next() else {
            tokio::select! {
                _ = stop_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(IDLE_POLL) => continue,
            }
        };

        // The head job owns the queue until it succeeds or is quarantined
        let now = Utc::now();
        if head.next_attempt_at > now {
            let wait = (head.next_attempt_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(IDLE_POLL);
            tokio::select! {
                _ = stop_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(wait) => continue,
            }
        }

        let attempt = head.attempt + 1;
        diagnostics.emit(DiagEvent::AttemptStarted {
            job_id: head.id.clone(),
            attempt,
        });

        match submitter.submit(&head.request).await {
            Ok(receipt) => {
                tracing::info!(
                    job_id = %head.id,
                    clip = %head.request.clip_name,
                    document_id = %receipt.document_id,
                    attempt,
                    "Clip ingested"
                );
                queue.record_success(&head.id, attempt).await?;
                diagnostics.emit(DiagEvent::Succeeded {
                    job_id: head.id,
                    attempt,
                });
            }
            Err(e) if policy.exhausted(attempt) => {
                tracing::warn!(
                    job_id = %head.id,
                    clip = %head.request.clip_name,
                    attempts = attempt,
                    error = %e,
                    "Upload abandoned after final attempt"
                );
                queue.record_given_up(&head.id, attempt).await?;
                diagnostics.emit(DiagEvent::GaveUp {
                    job_id: head.id,
                    attempts: attempt,
                });
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                let next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                tracing::warn!(
                    job_id = %head.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upload failed, retry scheduled"
                );
                queue
                    .record_failure(&head.id, attempt, next_attempt_at, &e.to_string())
                    .await?;
                diagnostics.emit(DiagEvent::RetryScheduled {
                    job_id: head.id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: e.to_string(),
                });
            }
        }

        if stop_rx.try_recv().is_ok() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClipSegment, ClipType, CloseReason, FinalizedClip};
    use crate::queue::diagnostics;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct ScriptedSubmitter {
        responses: Mutex<VecDeque<Result<ClipUploadReceipt, String>>>,
    }

    impl ScriptedSubmitter {
        fn new(responses: Vec<Result<ClipUploadReceipt, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }

        fn failing() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
            }
        }
    }

    fn receipt() -> ClipUploadReceipt {
        ClipUploadReceipt {
            document_id: "doc-1".to_string(),
            url: "http://127.0.0.1:8788/media/doc-1".to_string(),
            transcript_chars: 0,
        }
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(
            &self,
            _request: &ClipUploadRequest,
        ) -> Result<ClipUploadReceipt, SubmitError> {
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(r)) => Ok(r),
                Some(Err(body)) => Err(SubmitError::Status { status: 503, body }),
                None => Err(SubmitError::Status {
                    status: 503,
                    body: body_or_default(),
                }),
            }
        }
    }

    fn body_or_default() -> String {
        "service unavailable".to_string()
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            max_attempts,
        }
    }

    fn test_segment() -> ClipSegment {
        let start = Utc::now();
        ClipSegment {
            session_id: Uuid::new_v4(),
            name: "high-0001".to_string(),
            clip_type: ClipType::HighRes,
            reason: CloseReason::TriggerTimeout,
            started_at: start,
            ended_at: start + chrono::Duration::seconds(10),
            bytes: vec![0xCD; 64],
            mime_type: "video/webm".to_string(),
        }
    }

    fn bare(segment: ClipSegment) -> FinalizedClip {
        FinalizedClip {
            segment,
            transcript: Vec::new(),
            transcript_text: String::new(),
        }
    }

    async fn queue_with_one_job(temp: &TempDir) -> Arc<UploadQueue> {
        let queue = Arc::new(UploadQueue::new(temp.path().join("upload_queue.jsonl")));
        queue
            .enqueue(bare(test_segment()), &DiagnosticsHandle::noop())
            .await
            .unwrap();
        queue
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let temp = TempDir::new().unwrap();
        let queue = queue_with_one_job(&temp).await;
        let (diag, events) = diagnostics::collector();

        let submitter = Arc::new(ScriptedSubmitter::new(vec![
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Ok(receipt()),
        ]));

        let handle = spawn_worker(Arc::clone(&queue), submitter, fast_policy(8), diag);

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop().await.unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.succeeded, 1);
        assert_eq!(status.given_up, 0);

        let events = events.lock().unwrap();
        let retries = events
            .iter()
            .filter(|e| matches!(e, DiagEvent::RetryScheduled { .. }))
            .count();
        let successes = events
            .iter()
            .filter(|e| matches!(e, DiagEvent::Succeeded { .. }))
            .count();
        assert_eq!(retries, 3);
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_attempt_numbers_strictly_increase() {
        let temp = TempDir::new().unwrap();
        let queue = queue_with_one_job(&temp).await;
        let (diag, events) = diagnostics::collector();

        let handle = spawn_worker(
            Arc::clone(&queue),
            Arc::new(ScriptedSubmitter::failing()),
            fast_policy(4),
            diag,
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop().await.unwrap();

        let events = events.lock().unwrap();
        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                DiagEvent::AttemptStarted { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_quarantines_exactly_once_after_exhaustion() {
        let temp = TempDir::new().unwrap();
        let queue = queue_with_one_job(&temp).await;
        let (diag, events) = diagnostics::collector();

        let handle = spawn_worker(
            Arc::clone(&queue),
            Arc::new(ScriptedSubmitter::failing()),
            fast_policy(3),
            diag,
        );

        // Long enough for several extra cycles after exhaustion
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.stop().await.unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.given_up, 1);

        let events = events.lock().unwrap();
        let gave_up: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                DiagEvent::GaveUp { attempts, .. } => Some(*attempts),
                _ => None,
            })
            .collect();
        assert_eq!(gave_up, vec![3]);
    }

    #[tokio::test]
    async fn test_head_of_line_blocks_later_jobs() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(UploadQueue::new(temp.path().join("upload_queue.jsonl")));
        let diag = DiagnosticsHandle::noop();

        let mut first = test_segment();
        first.name = "high-0001".to_string();
        let mut second = test_segment();
        second.name = "high-0002".to_string();

        queue.enqueue(bare(first), &diag).await.unwrap();
        queue.enqueue(bare(second), &diag).await.unwrap();

        let submitted = Arc::new(Mutex::new(Vec::<String>::new()));

        struct RecordingSubmitter {
            submitted: Arc<Mutex<Vec<String>>>,
            fail_first_n: Mutex<u32>,
        }

        #[async_trait]
        impl Submitter for RecordingSubmitter {
            async fn submit(
                &self,
                request: &ClipUploadRequest,
            ) -> Result<ClipUploadReceipt, SubmitError> {
                self.submitted.lock().unwrap().push(request.clip_name.clone());
                let mut remaining = self.fail_first_n.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SubmitError::Status {
                        status: 503,
                        body: body_or_default(),
                    });
                }
                Ok(receipt())
            }
        }

        let submitter = Arc::new(RecordingSubmitter {
            submitted: Arc::clone(&submitted),
            fail_first_n: Mutex::new(2),
        });

        let handle = spawn_worker(
            Arc::clone(&queue),
            submitter,
            fast_policy(8),
            DiagnosticsHandle::noop(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop().await.unwrap();

        // The second clip is never attempted before the first succeeds
        let order = submitted.lock().unwrap();
        assert_eq!(
            order.as_slice(),
            &["high-0001", "high-0001", "high-0001", "high-0002"]
        );
    }
}
