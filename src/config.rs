//! Configuration for livecap.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LIVECAP_HOME, LIVECAP_INGEST_URL, ...)
//! 2. Config file (.livecap/config.yaml)
//! 3. Defaults (~/.livecap)
//!
//! Config file discovery searches the current directory and parents for
//! .livecap/config.yaml.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub capture: Option<CaptureConfigFile>,
    #[serde(default)]
    pub queue: Option<QueueConfigFile>,
    #[serde(default)]
    pub server: Option<ServerConfigFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureConfigFile {
    pub window_seconds: Option<u64>,
    pub trigger_clip_seconds: Option<u64>,
    pub wake_word: Option<String>,
    pub stop_word: Option<String>,
    pub wake_cooldown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfigFile {
    pub ingest_url: Option<String>,
    pub diagnostics_url: Option<String>,
    pub backoff_base_seconds: Option<u64>,
    pub backoff_cap_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigFile {
    pub bind_address: Option<String>,
    pub storage_dir: Option<String>,
    pub storage_bucket: Option<String>,
    pub public_base_url: Option<String>,
    pub collection: Option<String>,
    pub encoder_path: Option<String>,
    pub encode_timeout_seconds: Option<u64>,
    pub transcribe_url: Option<String>,
    pub transcribe_model: Option<String>,
}

/// Capture tunables
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Rolling low-res window length
    pub window: Duration,

    /// Fixed high-res clip duration
    pub trigger_clip: Duration,

    pub wake_word: String,
    pub stop_word: String,

    /// Minimum gap between accepted wake triggers
    pub wake_cooldown: Duration,

    /// Delay before restarting a failed recognizer
    pub listener_restart_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            trigger_clip: Duration::from_secs(10),
            wake_word: "record".to_string(),
            stop_word: "stop".to_string(),
            wake_cooldown: Duration::from_secs(5),
            listener_restart_delay: Duration::from_millis(1500),
        }
    }
}

/// Upload queue tunables
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Ingestion endpoint (POST /clips)
    pub ingest_url: String,

    /// Best-effort diagnostics relay (POST /log), if any
    pub diagnostics_url: Option<String>,

    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,

    /// Per-request network timeout
    pub request_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            ingest_url: "http://127.0.0.1:8788/clips".to_string(),
            diagnostics_url: None,
            backoff_base: Duration::from_secs(3),
            backoff_cap: Duration::from_secs(60),
            max_attempts: 8,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Ingestion server tunables
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_address: String,

    /// Local directory backing the object store
    pub storage_dir: PathBuf,

    /// Bucket/container name recorded in metadata
    pub storage_bucket: String,

    /// Base URL from which stored objects are publicly readable
    pub public_base_url: String,

    /// Metadata collection (table) name
    pub collection: String,

    /// External encoder binary
    pub encoder_path: String,
    pub encode_timeout: Duration,

    /// Speech-to-text endpoint and model
    pub transcribe_url: String,
    pub transcribe_model: String,

    /// Bearer token for the speech-to-text API (from LIVECAP_STT_TOKEN)
    pub transcribe_token: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to livecap home (queue state, index, storage)
    pub home: PathBuf,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,

    pub capture: CaptureSettings,
    pub queue: QueueSettings,
    pub server: ServerSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".livecap").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".livecap");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = env_var("LIVECAP_HOME")
        .map(PathBuf::from)
        .unwrap_or(default_home);

    let capture_file = file
        .as_ref()
        .and_then(|f| f.capture.clone())
        .unwrap_or_default();
    let queue_file = file
        .as_ref()
        .and_then(|f| f.queue.clone())
        .unwrap_or_default();
    let server_file = file
        .as_ref()
        .and_then(|f| f.server.clone())
        .unwrap_or_default();

    let capture_defaults = CaptureSettings::default();
    let capture = CaptureSettings {
        window: capture_file
            .window_seconds
            .map(Duration::from_secs)
            .unwrap_or(capture_defaults.window),
        trigger_clip: capture_file
            .trigger_clip_seconds
            .map(Duration::from_secs)
            .unwrap_or(capture_defaults.trigger_clip),
        wake_word: env_var("LIVECAP_WAKE_WORD")
            .or(capture_file.wake_word)
            .unwrap_or(capture_defaults.wake_word),
        stop_word: env_var("LIVECAP_STOP_WORD")
            .or(capture_file.stop_word)
            .unwrap_or(capture_defaults.stop_word),
        wake_cooldown: capture_file
            .wake_cooldown_seconds
            .map(Duration::from_secs)
            .unwrap_or(capture_defaults.wake_cooldown),
        listener_restart_delay: capture_defaults.listener_restart_delay,
    };

    let queue_defaults = QueueSettings::default();
    let queue = QueueSettings {
        ingest_url: env_var("LIVECAP_INGEST_URL")
            .or(queue_file.ingest_url)
            .unwrap_or(queue_defaults.ingest_url),
        diagnostics_url: env_var("LIVECAP_DIAGNOSTICS_URL").or(queue_file.diagnostics_url),
        backoff_base: queue_file
            .backoff_base_seconds
            .map(Duration::from_secs)
            .unwrap_or(queue_defaults.backoff_base),
        backoff_cap: queue_file
            .backoff_cap_seconds
            .map(Duration::from_secs)
            .unwrap_or(queue_defaults.backoff_cap),
        max_attempts: queue_file
            .max_attempts
            .unwrap_or(queue_defaults.max_attempts),
        request_timeout: queue_file
            .request_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(queue_defaults.request_timeout),
    };

    let server = ServerSettings {
        bind_address: env_var("LIVECAP_BIND")
            .or(server_file.bind_address)
            .unwrap_or_else(|| "127.0.0.1:8788".to_string()),
        storage_dir: env_var("LIVECAP_STORAGE_DIR")
            .or(server_file.storage_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("storage")),
        storage_bucket: server_file
            .storage_bucket
            .unwrap_or_else(|| "livecap-media".to_string()),
        public_base_url: env_var("LIVECAP_PUBLIC_BASE_URL")
            .or(server_file.public_base_url)
            .unwrap_or_else(|| "http://127.0.0.1:8788/media".to_string()),
        collection: server_file
            .collection
            .unwrap_or_else(|| "media_metadata".to_string()),
        encoder_path: env_var("LIVECAP_ENCODER_PATH")
            .or(server_file.encoder_path)
            .unwrap_or_else(|| "ffmpeg".to_string()),
        encode_timeout: server_file
            .encode_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120)),
        transcribe_url: server_file
            .transcribe_url
            .unwrap_or_else(|| "https://api.openai.com/v1/audio/transcriptions".to_string()),
        transcribe_model: server_file
            .transcribe_model
            .unwrap_or_else(|| "whisper-1".to_string()),
        transcribe_token: env_var("LIVECAP_STT_TOKEN"),
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        capture,
        queue,
        server,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the livecap home directory
pub fn livecap_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Path of the persisted upload queue ($LIVECAP_HOME/upload_queue.jsonl)
pub fn queue_path() -> Result<PathBuf> {
    Ok(config()?.home.join("upload_queue.jsonl"))
}

/// Path of the metadata index database ($LIVECAP_HOME/index.db)
pub fn index_path() -> Result<PathBuf> {
    Ok(config()?.home.join("index.db"))
}
