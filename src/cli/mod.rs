//! Command-line interface for livecap.
//!
//! `serve` runs the ingestion server; `capture` runs a client session
//! against a simulated or file-backed media source; `queue` inspects and
//! resubmits upload jobs; `health` probes a running server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::capture::{
    drive, CaptureController, FileMediaSource, MediaSource, ScriptedRecognizer, SimulatedSource,
    TriggerListener,
};
use crate::config;
use crate::queue::{
    diagnostics, spawn_worker, BackoffPolicy, HttpSubmitter, JobState, UploadQueue,
};
use crate::server;

/// livecap - segmented capture client and clip ingestion server
#[derive(Parser, Debug)]
#[command(name = "livecap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingestion server
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Run a capture session for a fixed duration
    Capture {
        /// Media file to window into segments (simulated source if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// How long to keep capturing, in seconds
        #[arg(short, long, default_value = "35")]
        duration: u64,

        /// Rolling window length in seconds (overrides config)
        #[arg(short, long)]
        window: Option<u64>,

        /// Transcript lines to feed the trigger listener (repeatable)
        #[arg(long = "say")]
        say: Vec<String>,

        /// Enqueue segments without starting the upload worker
        #[arg(long)]
        no_upload: bool,
    },

    /// Inspect and manage the upload queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Probe a running ingestion server
    Health,

    /// Show resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show queue counts and recent jobs
    Status,

    /// Re-enqueue quarantined jobs with a reset attempt counter
    Resubmit {
        /// Job id to resubmit (all quarantined jobs if omitted)
        job_id: Option<String>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { address } => execute_serve(address).await,
            Commands::Capture {
                input,
                duration,
                window,
                say,
                no_upload,
            } => execute_capture(input, duration, window, say, no_upload).await,
            Commands::Queue { command } => match command {
                QueueCommands::Status => execute_queue_status().await,
                QueueCommands::Resubmit { job_id } => execute_queue_resubmit(job_id).await,
            },
            Commands::Health => execute_health().await,
            Commands::Config => execute_config(),
        }
    }
}

async fn execute_serve(address: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let mut settings = cfg.server.clone();
    if let Some(address) = address {
        settings.bind_address = address;
    }

    server::serve(&settings, config::index_path()?).await
}

async fn execute_capture(
    input: Option<PathBuf>,
    duration: u64,
    window: Option<u64>,
    say: Vec<String>,
    no_upload: bool,
) -> Result<()> {
    let cfg = config::config()?;
    let mut settings = cfg.capture.clone();
    if let Some(window) = window {
        settings.window = Duration::from_secs(window);
    }

    let diagnostics = diagnostics::spawn_relay(cfg.queue.diagnostics_url.clone());
    let queue = Arc::new(UploadQueue::open_default().await?);

    let source: Arc<dyn MediaSource> = match input {
        Some(path) => Arc::new(
            FileMediaSource::open(&path)
                .with_context(|| format!("Failed to open media file {}", path.display()))?,
        ),
        None => Arc::new(SimulatedSource::new()),
    };

    let recognizer = if say.is_empty() {
        Arc::new(ScriptedRecognizer::new(Vec::new()))
    } else {
        let lines: Vec<&str> = say.iter().map(String::as_str).collect();
        Arc::new(ScriptedRecognizer::single_session(&lines))
    };

    let listener = TriggerListener::new(recognizer, &settings)?;
    let (listener_events, listener_handle) = listener.start()?;

    let (segment_tx, mut segment_rx) = mpsc::channel(16);
    let mut controller =
        CaptureController::new(settings, source, segment_tx, diagnostics.clone());
    controller.start().await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let driver = tokio::spawn(drive(controller, listener_events, shutdown_rx));

    let enqueue_queue = Arc::clone(&queue);
    let enqueue_diag = diagnostics.clone();
    let enqueuer = tokio::spawn(async move {
        let mut queued = 0usize;
        while let Some(clip) = segment_rx.recv().await {
            match enqueue_queue.enqueue(clip, &enqueue_diag).await {
                Ok(outcome) if outcome.is_new() => queued += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Failed to enqueue clip"),
            }
        }
        queued
    });

    let worker = if no_upload {
        None
    } else {
        let submitter = Arc::new(HttpSubmitter::new(&cfg.queue)?);
        Some(spawn_worker(
            Arc::clone(&queue),
            submitter,
            BackoffPolicy::from_settings(&cfg.queue),
            diagnostics.clone(),
        ))
    };

    println!("Capturing for {}s (wake word: say it to trigger a clip)...", duration);
    tokio::time::sleep(Duration::from_secs(duration)).await;

    let _ = shutdown_tx.send(()).await;
    let controller = driver.await.context("Capture driver failed")?;
    drop(controller);

    let queued = enqueuer.await.context("Enqueue task failed")?;
    listener_handle.stop().await?;

    if let Some(worker) = worker {
        // Give in-flight uploads a moment before stopping the worker
        tokio::time::sleep(Duration::from_millis(500)).await;
        worker.stop().await?;
    }

    let status = queue.status().await?;
    println!();
    println!("Session finished: {} segment(s) queued", queued);
    println!(
        "Queue: {} pending, {} succeeded, {} quarantined",
        status.pending, status.succeeded, status.given_up
    );

    Ok(())
}

async fn execute_queue_status() -> Result<()> {
    let queue = UploadQueue::open_default().await?;
    let status = queue.status().await?;

    println!();
    println!("Upload Queue Status");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Queue file:  {}", config::queue_path()?.display());
    println!();
    println!("Queue:");
    println!("  Pending:     {}", status.pending);
    println!("  Succeeded:   {}", status.succeeded);
    println!("  Quarantined: {}", status.given_up);
    println!();

    if !status.recent.is_empty() {
        println!("Recent:");
        for job in &status.recent {
            let state = match job.state {
                JobState::Pending => "PEND",
                JobState::Succeeded => "DONE",
                JobState::GivenUp => "FAIL",
            };
            println!(
                "  [{}] {} ({}, attempt {})",
                state, job.request.clip_name, job.id, job.attempt
            );
        }
        println!();
    }

    Ok(())
}

async fn execute_queue_resubmit(job_id: Option<String>) -> Result<()> {
    let queue = UploadQueue::open_default().await?;

    match job_id {
        Some(id) => {
            queue.resubmit(&id).await?;
            println!("Resubmitted {}", id);
        }
        None => {
            let count = queue
                .resubmit_all(&crate::queue::DiagnosticsHandle::noop())
                .await?;
            println!("Resubmitted {} quarantined job(s)", count);
        }
    }

    Ok(())
}

async fn execute_health() -> Result<()> {
    let cfg = config::config()?;
    let health_url = cfg
        .queue
        .ingest_url
        .trim_end_matches('/')
        .trim_end_matches("/clips")
        .to_string()
        + "/health";

    let response = reqwest::Client::new()
        .get(&health_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .with_context(|| format!("Health probe failed for {}", health_url))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.context("Invalid health response")?;

    println!("{} {}", status.as_u16(), health_url);
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn execute_config() -> Result<()> {
    let cfg = config::config()?;

    println!();
    println!("livecap configuration");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Home:         {}", cfg.home.display());
    match &cfg.config_file {
        Some(path) => println!("Config file:  {}", path.display()),
        None => println!("Config file:  (none found, using defaults)"),
    }
    println!();
    println!("Capture:");
    println!("  Window:        {:?}", cfg.capture.window);
    println!("  Trigger clip:  {:?}", cfg.capture.trigger_clip);
    println!("  Wake word:     {}", cfg.capture.wake_word);
    println!("  Stop word:     {}", cfg.capture.stop_word);
    println!("  Wake cooldown: {:?}", cfg.capture.wake_cooldown);
    println!();
    println!("Queue:");
    println!("  Ingest URL:    {}", cfg.queue.ingest_url);
    println!(
        "  Diagnostics:   {}",
        cfg.queue.diagnostics_url.as_deref().unwrap_or("(disabled)")
    );
    println!("  Backoff:       base {:?}, cap {:?}", cfg.queue.backoff_base, cfg.queue.backoff_cap);
    println!("  Max attempts:  {}", cfg.queue.max_attempts);
    println!();
    println!("Server:");
    println!("  Bind:          {}", cfg.server.bind_address);
    println!("  Storage dir:   {}", cfg.server.storage_dir.display());
    println!("  Bucket:        {}", cfg.server.storage_bucket);
    println!("  Public base:   {}", cfg.server.public_base_url);
    println!("  Collection:    {}", cfg.server.collection);
    println!("  Encoder:       {}", cfg.server.encoder_path);
    println!(
        "  STT token:     {}",
        if cfg.server.transcribe_token.is_some() {
            "configured"
        } else {
            "(not set)"
        }
    );
    println!();

    Ok(())
}
