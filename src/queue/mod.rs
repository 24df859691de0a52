//! Durable upload queue and its single consumer.

pub mod diagnostics;
pub mod upload;
pub mod worker;

pub use diagnostics::{DiagEvent, DiagnosticsHandle};
pub use upload::{
    dedup_key, BackoffPolicy, EnqueueOutcome, JobState, QueueError, QueueStatus, UploadJob,
    UploadQueue,
};
pub use worker::{spawn_worker, HttpSubmitter, SubmitError, Submitter, WorkerHandle};
