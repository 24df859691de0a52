//! livecap - segmented media capture client and clip ingestion server
//!
//! The client side records a continuous low-res rolling window alongside
//! on-demand high-res trigger clips, annotates finalized segments with a
//! live transcript timeline, and feeds them through a durable upload queue
//! with a single retrying consumer.
//!
//! The server side ingests one clip per request through four strictly
//! ordered stages: transcode, transcribe, store, index. The first two
//! degrade gracefully with recorded provenance; only storage and index
//! failures fail a request.
//!
//! # Modules
//!
//! - `capture`: media sources, the segmented capture controller, and the
//!   speech trigger listener
//! - `queue`: durable upload queue, its single worker, and diagnostics
//! - `pipeline`: the four ingestion stages
//! - `server`: the axum ingestion endpoint
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the ingestion server
//! livecap serve
//!
//! # Capture for 35 seconds against the simulated source
//! livecap capture --duration 35 --say "record now while searing chicken"
//!
//! # Inspect the upload queue
//! livecap queue status
//! ```

pub mod capture;
pub mod cli;
pub mod config;
pub mod domain;
pub mod pipeline;
pub mod queue;
pub mod server;

// Re-export main types at crate root for convenience
pub use capture::{CaptureController, TriggerListener};
pub use domain::{ClipMetadataRecord, ClipSegment, ClipType, CloseReason, FinalizedClip, Session};
pub use pipeline::IngestPipeline;
pub use queue::{BackoffPolicy, UploadQueue};
