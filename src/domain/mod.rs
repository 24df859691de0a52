//! Domain types for livecap.
//!
//! - Session: one capture run with its transcript timeline
//! - ClipSegment: a finalized, immutable recording unit
//! - Wire types and the persisted ClipMetadataRecord

pub mod clip;
pub mod record;
pub mod session;

// Re-export commonly used types
pub use clip::{dedup_key, ClipSegment, ClipType, CloseReason};
pub use record::{
    ClipMetadataRecord, ClipUploadReceipt, ClipUploadRequest, EncodeStatus, TranscribeStatus,
    TranscriptProvenance, WireTranscriptEntry,
};
pub use session::{FinalizedClip, Session, TranscriptEntry, TranscriptSource};
