//! Engine configuration: CLI/env > TOML file > built-in defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

pub const DEFAULT_THROTTLE_MS: u64 = 2_000;
pub const MIN_THROTTLE_MS: u64 = 500;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_MAX_DEBOUNCE_MS: u64 = DEFAULT_DEBOUNCE_MS * 2;
pub const DEFAULT_CORRELATION_WINDOW_SECS: i64 = 10;
pub const DEFAULT_CORRELATION_SLACK_SECS: i64 = 5;
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 4;
pub const DEFAULT_SETTINGS_POLL_SECS: u64 = 5;
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_TAILED_FILES: usize = 256;
pub const DEFAULT_RING_CAPACITY: usize = 64;

/// `{data_dir}/config.toml` — optional overrides for engine-wide defaults.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    transcript_root: Option<PathBuf>,
    log: Option<String>,
    throttle_ms: Option<u64>,
    max_file_bytes: Option<u64>,
    global_concurrency: Option<usize>,
    settings_poll_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub store_path: PathBuf,
    pub transcript_root: Option<PathBuf>,
    pub log: String,
    pub default_throttle_ms: u64,
    pub default_max_file_bytes: u64,
    pub global_concurrency: usize,
    pub settings_poll_secs: u64,
}

impl EngineConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(
        data_dir: Option<PathBuf>,
        store_path: Option<PathBuf>,
        transcript_root: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let transcript_root = transcript_root
            .or_else(|| std::env::var("AUTOCOMMIT_TRANSCRIPT_ROOT").ok().map(PathBuf::from))
            .or(toml.transcript_root);

        let store_path = store_path
            .or_else(|| std::env::var("AUTOCOMMIT_STORE_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("shadow.db"));

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let default_throttle_ms = toml.throttle_ms.unwrap_or(DEFAULT_THROTTLE_MS).max(MIN_THROTTLE_MS);
        let default_max_file_bytes = toml.max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES);
        let global_concurrency = toml.global_concurrency.unwrap_or(DEFAULT_GLOBAL_CONCURRENCY);
        let settings_poll_secs = toml.settings_poll_secs.unwrap_or(DEFAULT_SETTINGS_POLL_SECS);

        Self {
            data_dir,
            store_path,
            transcript_root,
            log,
            default_throttle_ms,
            default_max_file_bytes,
            global_concurrency,
            settings_poll_secs,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn patterns_dir(&self) -> PathBuf {
        self.data_dir.join("patterns")
    }
}

pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("shadowd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("shadowd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("shadowd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("shadowd");
        }
    }
    PathBuf::from(".shadowd")
}
