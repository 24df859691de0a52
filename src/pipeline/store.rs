//! Object store adapter.
//!
//! Stage three of ingestion: final clip bytes are written under a path
//! namespaced by session and clip name, and a stable public URL is returned.
//! Unlike the earlier stages this one never degrades; a store failure fails
//! the request.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ServerSettings;

/// Location of a stored object
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Stable public URL
    pub url: String,

    /// Bucket/container name
    pub bucket: String,

    /// Path within the bucket
    pub path: String,
}

/// Durable public-readable object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], mime_type: &str) -> Result<StoredObject>;
}

/// Storage path for a clip, partitioned by session
pub fn clip_path(session_id: Uuid, clip_name: &str) -> String {
    format!("sessions/{}/{}", session_id, clip_name)
}

/// Filesystem-backed object store serving objects from a public base URL
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
    public_base_url: String,
}

impl FsObjectStore {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            root: settings.storage_dir.clone(),
            bucket: settings.storage_bucket.clone(),
            public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_root(
        root: PathBuf,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            root,
            bucket: bucket.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8], mime_type: &str) -> Result<StoredObject> {
        let started = std::time::Instant::now();
        let full_path = self.root.join(path);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create storage directory")?;
        }

        tokio::fs::write(&full_path, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", full_path.display()))?;

        tracing::info!(
            path,
            mime_type,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Object stored"
        );

        Ok(StoredObject {
            url: format!("{}/{}", self.public_base_url, path),
            bucket: self.bucket.clone(),
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clip_path_namespaced_by_session() {
        let session = Uuid::new_v4();
        let path = clip_path(session, "low-0001.mp4");
        assert_eq!(path, format!("sessions/{}/low-0001.mp4", session));
    }

    #[tokio::test]
    async fn test_put_writes_bytes_and_builds_url() {
        let temp = TempDir::new().unwrap();
        let store = FsObjectStore::with_root(
            temp.path().to_path_buf(),
            "livecap-media",
            "http://127.0.0.1:8788/media/",
        );

        let stored = store
            .put("sessions/s1/low-0001.mp4", &[7, 7, 7], "video/mp4")
            .await
            .unwrap();

        assert_eq!(stored.bucket, "livecap-media");
        assert_eq!(stored.path, "sessions/s1/low-0001.mp4");
        assert_eq!(
            stored.url,
            "http://127.0.0.1:8788/media/sessions/s1/low-0001.mp4"
        );

        let on_disk = std::fs::read(temp.path().join("sessions/s1/low-0001.mp4")).unwrap();
        assert_eq!(on_disk, vec![7, 7, 7]);
    }
}
