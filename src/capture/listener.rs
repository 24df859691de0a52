//! Speech trigger listener.
//!
//! Runs a continuous recognition loop against a `SpeechRecognizer`, detects
//! wake/stop words with whole-word matching, and restarts the recognizer on
//! transient errors. Modeled as an explicit state machine
//! {idle, listening, restart-pending, stopped} driven by discrete events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::recorder::Capability;
use crate::config::CaptureSettings;

/// Errors starting the listener
#[derive(Debug, Error)]
pub enum ListenerStartError {
    /// The platform has no recognition capability. Surfaced once, not retried.
    #[error("Speech recognition unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid trigger word '{word}': {detail}")]
    InvalidTriggerWord { word: String, detail: String },
}

/// Events from one recognition session
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// A recognized utterance
    Transcript(String),

    /// The session hit a recoverable error
    Error(String),

    /// The session ended without error
    Ended,
}

/// A speech recognition backend.
///
/// `listen` opens one recognition session; the listener restarts sessions
/// itself, so implementations never need their own retry logic.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Probe whether recognition is available at all
    fn probe(&self) -> Capability;

    /// Open one recognition session
    async fn listen(&self) -> Result<mpsc::Receiver<RecognizerEvent>>;
}

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    RestartPending,
    Stopped,
}

/// Events the listener emits to the capture controller
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A recognized utterance (also carries wake/stop-bearing text)
    Transcript { text: String },

    /// The wake word was matched outside the cooldown window
    WakeDetected { text: String },

    /// The stop word was matched
    StopDetected { text: String },

    /// The wake word was matched but suppressed by the cooldown
    WakeSuppressed { text: String },

    /// The recognizer failed and a restart is scheduled
    Restarting { reason: String },
}

/// Whole-word matcher for wake/stop words.
///
/// "recorder" must not match when the trigger word is "record", so matching
/// is anchored on word boundaries, case-insensitively.
#[derive(Debug, Clone)]
pub struct WordMatcher {
    regex: Regex,
}

impl WordMatcher {
    pub fn new(word: &str) -> Result<Self, ListenerStartError> {
        let trimmed = word.trim();
        if trimmed.is_empty() {
            return Err(ListenerStartError::InvalidTriggerWord {
                word: word.to_string(),
                detail: "empty trigger word".to_string(),
            });
        }

        let pattern = format!(r"(?i)\b{}\b", regex::escape(trimmed));
        let regex = Regex::new(&pattern).map_err(|e| ListenerStartError::InvalidTriggerWord {
            word: word.to_string(),
            detail: e.to_string(),
        })?;

        Ok(Self { regex })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Handle to a running listener
pub struct ListenerHandle {
    stop_tx: mpsc::Sender<()>,
    state: Arc<Mutex<ListenerState>>,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    /// Current listener state
    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }

    /// Halt recognition and suppress any pending restart
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// Continuous speech trigger listener
pub struct TriggerListener {
    recognizer: Arc<dyn SpeechRecognizer>,
    wake: WordMatcher,
    stop: WordMatcher,
    cooldown: Duration,
    restart_delay: Duration,
}

impl TriggerListener {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        settings: &CaptureSettings,
    ) -> Result<Self, ListenerStartError> {
        Ok(Self {
            recognizer,
            wake: WordMatcher::new(&settings.wake_word)?,
            stop: WordMatcher::new(&settings.stop_word)?,
            cooldown: settings.wake_cooldown,
            restart_delay: settings.listener_restart_delay,
        })
    }

    /// Begin continuous recognition.
    ///
    /// Fails with `Unavailable` if the backend has no recognition capability;
    /// that failure is surfaced once and never retried.
    pub fn start(self) -> Result<(mpsc::Receiver<ListenerEvent>, ListenerHandle), ListenerStartError>
    {
        if let Capability::Unavailable { reason } = self.recognizer.probe() {
            return Err(ListenerStartError::Unavailable(reason));
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let state = Arc::new(Mutex::new(ListenerState::Idle));

        let loop_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            self.run(event_tx, stop_rx, loop_state).await;
        });

        Ok((
            event_rx,
            ListenerHandle {
                stop_tx,
                state,
                task,
            },
        ))
    }

    async fn run(
        self,
        event_tx: mpsc::Sender<ListenerEvent>,
        mut stop_rx: mpsc::Receiver<()>,
        state: Arc<Mutex<ListenerState>>,
    ) {
        let set_state = |s: ListenerState| *state.lock().unwrap() = s;
        let mut last_wake: Option<Instant> = None;

        'outer: loop {
            let mut session = match self.recognizer.listen().await {
                Ok(rx) => {
                    set_state(ListenerState::Listening);
                    rx
                }
                Err(e) => {
                    // Session setup failure is recoverable like any other
                    // recognition error: schedule a restart.
                    set_state(ListenerState::RestartPending);
                    let _ = event_tx
                        .send(ListenerEvent::Restarting {
                            reason: e.to_string(),
                        })
                        .await;
                    tokio::select! {
                        _ = stop_rx.recv() => break 'outer,
                        _ = tokio::time::sleep(self.restart_delay) => continue 'outer,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break 'outer,
                    event = session.recv() => {
                        let restart_reason = match event {
                            Some(RecognizerEvent::Transcript(text)) => {
                                self.handle_transcript(&text, &event_tx, &mut last_wake).await;
                                continue;
                            }
                            Some(RecognizerEvent::Error(reason)) => reason,
                            Some(RecognizerEvent::Ended) | None => "session ended".to_string(),
                        };

                        set_state(ListenerState::RestartPending);
                        let _ = event_tx
                            .send(ListenerEvent::Restarting { reason: restart_reason })
                            .await;
                        tokio::select! {
                            _ = stop_rx.recv() => break 'outer,
                            _ = tokio::time::sleep(self.restart_delay) => {}
                        }
                        continue 'outer;
                    }
                }
            }
        }

        set_state(ListenerState::Stopped);
    }

    async fn handle_transcript(
        &self,
        text: &str,
        event_tx: &mpsc::Sender<ListenerEvent>,
        last_wake: &mut Option<Instant>,
    ) {
        let _ = event_tx
            .send(ListenerEvent::Transcript {
                text: text.to_string(),
            })
            .await;

        if self.stop.matches(text) {
            let _ = event_tx
                .send(ListenerEvent::StopDetected {
                    text: text.to_string(),
                })
                .await;
            return;
        }

        if self.wake.matches(text) {
            let now = Instant::now();
            let within_cooldown = last_wake
                .map(|t| now.duration_since(t) < self.cooldown)
                .unwrap_or(false);

            if within_cooldown {
                tracing::debug!(%text, "Wake word suppressed by cooldown");
                let _ = event_tx
                    .send(ListenerEvent::WakeSuppressed {
                        text: text.to_string(),
                    })
                    .await;
            } else {
                *last_wake = Some(now);
                let _ = event_tx
                    .send(ListenerEvent::WakeDetected {
                        text: text.to_string(),
                    })
                    .await;
            }
        }
    }
}

// ============================================================================
// Scripted recognizer (tests, simulated capture)
// ============================================================================

use std::collections::VecDeque;

/// A recognizer that plays back scripted sessions.
///
/// Each inner vec is one session: (delay before event, event). When all
/// sessions are consumed, further `listen` calls return an idle session.
pub struct ScriptedRecognizer {
    sessions: Mutex<VecDeque<Vec<(Duration, RecognizerEvent)>>>,
    available: bool,
}

impl ScriptedRecognizer {
    pub fn new(sessions: Vec<Vec<(Duration, RecognizerEvent)>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            available: true,
        }
    }

    /// A recognizer whose capability probe fails
    pub fn unavailable() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            available: false,
        }
    }

    /// Convenience: one session of transcripts, 1 ms apart
    pub fn single_session(lines: &[&str]) -> Self {
        let session = lines
            .iter()
            .map(|l| {
                (
                    Duration::from_millis(1),
                    RecognizerEvent::Transcript(l.to_string()),
                )
            })
            .collect();
        Self::new(vec![session])
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    fn probe(&self) -> Capability {
        if self.available {
            Capability::Available
        } else {
            Capability::Unavailable {
                reason: "no recognition backend on this platform".to_string(),
            }
        }
    }

    async fn listen(&self) -> Result<mpsc::Receiver<RecognizerEvent>> {
        let script = self.sessions.lock().unwrap().pop_front();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let Some(script) = script else {
                // Idle session: hold the channel open until the listener stops
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return;
            };
            for (delay, event) in script {
                tokio::time::sleep(delay).await;
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
