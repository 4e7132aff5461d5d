use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CHECK_INTERVAL_SECONDS, DEFAULT_DATABASE_PATH, DEFAULT_GATEWAY_URL_TEMPLATE,
    DEFAULT_HTTP_TIMEOUT_SECONDS, DEFAULT_IPFS_API_ADDRESS, DEFAULT_MAX_CONCURRENT_RECORDERS,
    DEFAULT_MEMORY_BUDGET_MIB, DEFAULT_PLAYLIST_TYPE, DEFAULT_REQUEST_SIZE_LIMIT_BYTES,
};
use crate::playlist::PlaylistType;

fn default_check_interval_seconds() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECONDS
}

fn default_max_concurrent_recorders() -> usize {
    DEFAULT_MAX_CONCURRENT_RECORDERS
}

fn default_memory_budget_mib() -> u64 {
    DEFAULT_MEMORY_BUDGET_MIB
}

fn default_request_size_limit_bytes() -> u64 {
    DEFAULT_REQUEST_SIZE_LIMIT_BYTES
}

fn default_ipfs_api_address() -> String {
    DEFAULT_IPFS_API_ADDRESS.to_string()
}

fn default_gateway_url_template() -> String {
    DEFAULT_GATEWAY_URL_TEMPLATE.to_string()
}

fn default_playlist_type() -> String {
    DEFAULT_PLAYLIST_TYPE.to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_http_timeout_seconds() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECONDS
}

/// Recorder configuration file structure (TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Seconds between roster passes (default: 120)
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    /// Maximum number of streams recorded at the same time (default: 8)
    #[serde(default = "default_max_concurrent_recorders")]
    pub max_concurrent_recorders: usize,
    /// Buffered bytes per recorder before a flush (default: derived)
    pub flush_threshold_bytes: Option<u64>,
    /// Memory available to the process in MiB (default: 512)
    #[serde(default = "default_memory_budget_mib")]
    pub memory_budget_mib: u64,
    /// Largest single request accepted by the IPFS API (default: 100 MiB)
    #[serde(default = "default_request_size_limit_bytes")]
    pub request_size_limit_bytes: u64,
    /// IPFS HTTP API address, multiaddr or http(s) URL
    #[serde(default = "default_ipfs_api_address")]
    pub ipfs_api_address: String,
    /// Public gateway URL with `{cid}` and `{path}` placeholders
    #[serde(default = "default_gateway_url_template")]
    pub gateway_url_template: String,
    /// HLS playlist URL of a streamer with a `{name}` placeholder (required)
    pub stream_url_template: String,
    /// `vod`, `event`, `live` or `none` (default: vod)
    #[serde(default = "default_playlist_type")]
    pub playlist_type: String,
    /// SQLite database holding streamers and streams (default: offstream.sqlite)
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Parent of the per-session temporary directories (default: system temp)
    pub temp_dir: Option<PathBuf>,
    /// Timeout of a single HTTP request in seconds (default: 30)
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

impl RecorderConfig {
    pub fn new(stream_url_template: impl Into<String>) -> Self {
        Self {
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECONDS,
            max_concurrent_recorders: DEFAULT_MAX_CONCURRENT_RECORDERS,
            flush_threshold_bytes: None,
            memory_budget_mib: DEFAULT_MEMORY_BUDGET_MIB,
            request_size_limit_bytes: DEFAULT_REQUEST_SIZE_LIMIT_BYTES,
            ipfs_api_address: default_ipfs_api_address(),
            gateway_url_template: default_gateway_url_template(),
            stream_url_template: stream_url_template.into(),
            playlist_type: default_playlist_type(),
            database_path: default_database_path(),
            temp_dir: None,
            http_timeout_seconds: DEFAULT_HTTP_TIMEOUT_SECONDS,
        }
    }

    /// Read a TOML file, apply `OFFSTREAM_*` environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let mut config: RecorderConfig = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override values from the environment; `lookup` returns a variable's value.
    ///
    /// Every key has an `OFFSTREAM_<KEY>` variable. The names used by older
    /// deployments (`OFFSTREAM_FLUSH_THRESHOLD`, `DYNO_RAM`,
    /// `OFFSTREAM_IPFS_API_ADDR`, `OFFSTREAM_IPFS_GATEWAY_URI_TEMPLATE`) are
    /// still read; the `OFFSTREAM_<KEY>` variable wins when both are set.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("Invalid value '{}' for {}", value, key))
        }

        let first = |keys: &[&'static str]| {
            keys.iter()
                .find_map(|key| lookup(key).map(|value| (*key, value)))
        };

        if let Some((key, value)) = first(&["OFFSTREAM_CHECK_INTERVAL_SECONDS"]) {
            self.check_interval_seconds = parse(key, value)?;
        }
        if let Some((key, value)) = first(&["OFFSTREAM_MAX_CONCURRENT_RECORDERS"]) {
            self.max_concurrent_recorders = parse(key, value)?;
        }
        if let Some((key, value)) =
            first(&["OFFSTREAM_FLUSH_THRESHOLD_BYTES", "OFFSTREAM_FLUSH_THRESHOLD"])
        {
            self.flush_threshold_bytes = Some(parse(key, value)?);
        }
        // DYNO_RAM is the Heroku dyno memory size in MiB
        if let Some((key, value)) = first(&["OFFSTREAM_MEMORY_BUDGET_MIB", "DYNO_RAM"]) {
            self.memory_budget_mib = parse(key, value)?;
        }
        if let Some((key, value)) = first(&["OFFSTREAM_REQUEST_SIZE_LIMIT_BYTES"]) {
            self.request_size_limit_bytes = parse(key, value)?;
        }
        if let Some((_, value)) = first(&["OFFSTREAM_IPFS_API_ADDRESS", "OFFSTREAM_IPFS_API_ADDR"]) {
            self.ipfs_api_address = value;
        }
        if let Some((_, value)) = first(&[
            "OFFSTREAM_GATEWAY_URL_TEMPLATE",
            "OFFSTREAM_IPFS_GATEWAY_URI_TEMPLATE",
        ]) {
            self.gateway_url_template = value;
        }
        if let Some((_, value)) = first(&["OFFSTREAM_STREAM_URL_TEMPLATE"]) {
            self.stream_url_template = value;
        }
        if let Some((_, value)) = first(&["OFFSTREAM_PLAYLIST_TYPE"]) {
            self.playlist_type = value;
        }
        if let Some((_, value)) = first(&["OFFSTREAM_DATABASE_PATH"]) {
            self.database_path = PathBuf::from(value);
        }
        if let Some((_, value)) = first(&["OFFSTREAM_TEMP_DIR"]) {
            self.temp_dir = Some(PathBuf::from(value));
        }
        if let Some((key, value)) = first(&["OFFSTREAM_HTTP_TIMEOUT_SECONDS"]) {
            self.http_timeout_seconds = parse(key, value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_recorders == 0 {
            return Err("max_concurrent_recorders must be at least 1".to_string());
        }
        if self.flush_threshold() == 0 {
            return Err("flush threshold must be greater than zero".to_string());
        }
        if !self.stream_url_template.contains("{name}") {
            return Err(format!(
                "stream_url_template '{}' has no {{name}} placeholder",
                self.stream_url_template
            ));
        }
        self.playlist_type()?;
        if !self.gateway_url_template.contains("{cid}") {
            return Err(format!(
                "gateway_url_template '{}' has no {{cid}} placeholder",
                self.gateway_url_template
            ));
        }
        Ok(())
    }

    /// Bytes a recorder buffers before flushing.
    ///
    /// Defaults to the memory budget shared by all recorders, capped by the
    /// IPFS request size limit.
    pub fn flush_threshold(&self) -> u64 {
        if let Some(threshold) = self.flush_threshold_bytes {
            return threshold;
        }
        let memory_budget = self.memory_budget_mib * 1024 * 1024;
        let per_recorder = memory_budget / self.max_concurrent_recorders.max(1) as u64;
        self.request_size_limit_bytes.min(per_recorder)
    }

    /// `#EXT-X-PLAYLIST-TYPE` of the published playlists, `none` omits the tag
    pub fn playlist_type(&self) -> Result<Option<PlaylistType>, String> {
        match self.playlist_type.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(None),
            other => other.parse().map(Some),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    /// Path of the lock file that keeps a second recorder off the same database
    pub fn lock_path(&self) -> PathBuf {
        let mut path = self.database_path.clone().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }
}
