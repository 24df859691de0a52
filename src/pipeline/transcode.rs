//! Transcode stage.
//!
//! Invokes an external encoder subprocess to normalize the clip container,
//! codecs, and audio loudness. Any encoder failure degrades to pass-through:
//! the original bytes are carried forward unchanged and the degradation is
//! recorded, never surfaced as a request failure.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ServerSettings;
use crate::domain::EncodeStatus;

/// Normalized output target
const TARGET_MIME: &str = "video/mp4";
const TARGET_EXTENSION: &str = "mp4";

/// Output of a successful encode
#[derive(Debug, Clone)]
pub struct EncodedClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub extension: &'static str,
}

/// External encoder invoked per clip
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, input: &[u8], input_mime: &str) -> Result<EncodedClip>;
}

/// Result of the transcode stage after degradation handling
#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    /// Bytes to carry forward (encoded or original)
    pub bytes: Vec<u8>,

    /// Mime type of the carried bytes
    pub mime_type: String,

    /// Clip name to store under (extension may have changed)
    pub clip_name: String,

    pub status: EncodeStatus,

    /// Encoder failure detail when status is PassThrough
    pub detail: Option<String>,
}

/// Run the encoder, falling back to the original bytes on any failure
pub async fn encode_or_passthrough(
    encoder: &dyn Encoder,
    bytes: Vec<u8>,
    mime_type: &str,
    clip_name: &str,
) -> TranscodeOutcome {
    let started = Instant::now();

    match encoder.encode(&bytes, mime_type).await {
        Ok(encoded) => {
            tracing::info!(
                clip = clip_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                input_bytes = bytes.len(),
                output_bytes = encoded.bytes.len(),
                "Transcode complete"
            );
            TranscodeOutcome {
                bytes: encoded.bytes,
                mime_type: encoded.mime_type,
                clip_name: with_extension(clip_name, encoded.extension),
                status: EncodeStatus::Encoded,
                detail: None,
            }
        }
        Err(e) => {
            tracing::warn!(
                clip = clip_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Transcode failed, storing original bytes"
            );
            TranscodeOutcome {
                bytes,
                mime_type: mime_type.to_string(),
                clip_name: clip_name.to_string(),
                status: EncodeStatus::PassThrough,
                detail: Some(e.to_string()),
            }
        }
    }
}

/// Replace (or append) the clip name's extension
fn with_extension(clip_name: &str, extension: &str) -> String {
    match clip_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{}.{}", stem, extension),
        _ => format!("{}.{}", clip_name, extension),
    }
}

/// Map an uploaded mime type to an input file extension for the encoder
fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type.split(';').next().unwrap_or_default().trim() {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "audio/webm" => "weba",
        "audio/ogg" => "ogg",
        _ => "webm",
    }
}

/// ffmpeg-based encoder with a fixed normalization profile
pub struct FfmpegEncoder {
    binary_path: String,
    encode_timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            binary_path: settings.encoder_path.clone(),
            encode_timeout: settings.encode_timeout,
        }
    }

    pub fn with_binary_path(binary_path: impl Into<String>, encode_timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            encode_timeout,
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, input: &[u8], input_mime: &str) -> Result<EncodedClip> {
        let temp_dir = tempfile::tempdir().context("Failed to create encoder temp dir")?;

        let input_path = temp_dir
            .path()
            .join(format!("input.{}", extension_for_mime(input_mime)));
        let output_path = temp_dir.path().join("output.mp4");

        tokio::fs::write(&input_path, input)
            .await
            .context("Failed to write encoder input")?;

        let child = Command::new(&self.binary_path)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(&input_path)
            .args(["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"])
            .args(["-c:a", "aac", "-b:a", "128k", "-ar", "48000"])
            .args(["-af", "loudnorm"])
            .args(["-movflags", "+faststart"])
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn encoder '{}'", self.binary_path))?;

        let output = timeout(self.encode_timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Encoder timed out after {:?}", self.encode_timeout))?
            .context("Failed to wait for encoder process")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Encoder exited with code {}: {}",
                exit_code,
                stderr.trim()
            );
        }

        let bytes = tokio::fs::read(&output_path)
            .await
            .context("Failed to read encoder output")?;

        Ok(EncodedClip {
            bytes,
            mime_type: TARGET_MIME.to_string(),
            extension: TARGET_EXTENSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticEncoder;

    #[async_trait]
    impl Encoder for StaticEncoder {
        async fn encode(&self, _input: &[u8], _input_mime: &str) -> Result<EncodedClip> {
            Ok(EncodedClip {
                bytes: vec![9, 9, 9],
                mime_type: TARGET_MIME.to_string(),
                extension: TARGET_EXTENSION,
            })
        }
    }

    struct BrokenEncoder;

    #[async_trait]
    impl Encoder for BrokenEncoder {
        async fn encode(&self, _input: &[u8], _input_mime: &str) -> Result<EncodedClip> {
            anyhow::bail!("encoder not installed")
        }
    }

    #[tokio::test]
    async fn test_success_swaps_extension_and_mime() {
        let outcome =
            encode_or_passthrough(&StaticEncoder, vec![1, 2, 3], "video/webm", "low-0001.webm")
                .await;

        assert_eq!(outcome.status, EncodeStatus::Encoded);
        assert_eq!(outcome.mime_type, "video/mp4");
        assert_eq!(outcome.clip_name, "low-0001.mp4");
        assert_eq!(outcome.bytes, vec![9, 9, 9]);
        assert!(outcome.detail.is_none());
    }

    #[tokio::test]
    async fn test_failure_passes_original_through() {
        let outcome =
            encode_or_passthrough(&BrokenEncoder, vec![1, 2, 3], "video/webm", "low-0001.webm")
                .await;

        assert_eq!(outcome.status, EncodeStatus::PassThrough);
        assert_eq!(outcome.mime_type, "video/webm");
        assert_eq!(outcome.clip_name, "low-0001.webm");
        assert_eq!(outcome.bytes, vec![1, 2, 3]);
        assert!(outcome.detail.as_deref().unwrap().contains("not installed"));
    }

    #[test]
    fn test_with_extension_handles_bare_names() {
        assert_eq!(with_extension("high-0002", "mp4"), "high-0002.mp4");
        assert_eq!(with_extension("high-0002.webm", "mp4"), "high-0002.mp4");
        assert_eq!(with_extension(".hidden", "mp4"), ".hidden.mp4");
    }

    #[test]
    fn test_extension_for_mime_strips_codec_suffix() {
        assert_eq!(extension_for_mime("video/webm;codecs=vp9,opus"), "webm");
        assert_eq!(extension_for_mime("video/mp4"), "mp4");
        assert_eq!(extension_for_mime("application/octet-stream"), "webm");
    }
}
