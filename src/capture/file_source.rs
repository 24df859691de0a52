//! File-backed media source.
//!
//! Windows a local media file into capture segments so the controller and
//! queue are exercisable end-to-end without platform device APIs. Every
//! finalized segment carries the whole file's bytes, which keeps each blob
//! an independently decodable container.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::recorder::{
    AudioRouting, Capability, DeviceError, MediaSource, MediaStream, RecordedBlob, Recorder,
    StreamProfile,
};

/// Media source replaying one local file
pub struct FileMediaSource {
    path: PathBuf,
    bytes: Vec<u8>,
    mime_type: String,
}

impl FileMediaSource {
    /// Read the file eagerly so open/record never touch the filesystem
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path)?;
        let mime_type = mime_for_path(&path).to_string();
        Ok(Self {
            path,
            bytes,
            mime_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
    {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "ogg" | "ogv" => "video/ogg",
        "weba" => "audio/webm",
        _ => "video/webm",
    }
}

#[async_trait]
impl MediaSource for FileMediaSource {
    fn probe(&self) -> Capability {
        if self.bytes.is_empty() {
            Capability::Unavailable {
                reason: format!("{} is empty", self.path.display()),
            }
        } else {
            Capability::Available
        }
    }

    async fn open(&self, profile: StreamProfile) -> Result<Box<dyn MediaStream>, DeviceError> {
        if self.bytes.is_empty() {
            return Err(DeviceError::Unavailable(format!(
                "{} is empty",
                self.path.display()
            )));
        }

        Ok(Box::new(FileStream {
            bytes: self.bytes.clone(),
            mime_type: self.mime_type.clone(),
            with_audio: profile.audio,
            released: AtomicBool::new(false),
        }))
    }
}

struct FileStream {
    bytes: Vec<u8>,
    mime_type: String,
    with_audio: bool,
    released: AtomicBool,
}

impl MediaStream for FileStream {
    fn has_live_audio(&self) -> bool {
        self.with_audio && !self.released.load(Ordering::SeqCst)
    }

    fn start_recorder(&self, _mime_type: &str, _audio: AudioRouting) -> Box<dyn Recorder> {
        Box::new(FileRecorder {
            bytes: self.bytes.clone(),
            mime_type: self.mime_type.clone(),
            started_at: Utc::now(),
        })
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

struct FileRecorder {
    bytes: Vec<u8>,
    mime_type: String,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl Recorder for FileRecorder {
    async fn stop(self: Box<Self>) -> RecordedBlob {
        RecordedBlob {
            bytes: self.bytes,
            mime_type: self.mime_type,
            started_at: self.started_at,
            ended_at: Utc::now(),
        }
    }
}
