use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;

/// Application configuration loaded once at startup from a JSON document.
///
/// Secrets never live in the document: the API bearer token is read from the
/// environment variable named by `api.bearer_token_env`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub inews: InewsConfig,

    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,

    /// Legacy single-rundown section; combined with `inews.rundown_path`.
    #[serde(default)]
    pub monitor: Option<LegacyMonitorConfig>,

    #[serde(default)]
    pub content: ContentConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize)]
pub struct InewsConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_ftp_timeout")]
    pub timeout_secs: u64,
    /// Legacy: rundown watched by the implicit `DEFAULT` monitor.
    #[serde(default)]
    pub rundown_path: Option<String>,
}

impl std::fmt::Debug for InewsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InewsConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("rundown_path", &self.rundown_path)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default)]
    pub name: String,
    pub rundown_path: String,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Story filter over `<ap>` bodies. Empty or `ROTULOS` admits stories
    /// with a qualifying label; anything else is a substring or regex.
    /// Unset inherits `monitor.ap_filter`.
    #[serde(default)]
    pub ap_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyMonitorConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub ap_filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_download_base")]
    pub download_base_path: PathBuf,
    /// Relative paths resolve against `download_base_path`.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: PathBuf,
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            download_base_path: default_download_base(),
            state_file: default_state_file(),
            manifest_file: default_manifest_file(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base")]
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub bearer_token_env: String,
    /// Filled from the environment by [`Config::load`].
    #[serde(skip)]
    pub bearer_token: String,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            bearer_token_env: default_token_env(),
            bearer_token: String::new(),
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            max_wait_secs: default_max_wait_secs(),
            max_retries: default_retries(),
        }
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("bearer_token_env", &self.bearer_token_env)
            .field("bearer_token", &"<redacted>")
            .field("requests_per_window", &self.requests_per_window)
            .field("window_secs", &self.window_secs)
            .field("max_wait_secs", &self.max_wait_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retries")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_retries(),
            backoff_base_ms: default_backoff_ms(),
            timeout_secs: default_download_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_retries")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retries(),
            backoff_base_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupConfig {
    /// Defaults to the shortest monitor interval.
    #[serde(default)]
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Config {
    /// Read, parse, resolve secrets and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_json(&raw, &path.display().to_string())?;
        config.resolve_secrets(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the document only. Secrets stay empty until [`Config::resolve_secrets`].
    pub fn from_json(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn resolve_secrets<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup(&self.api.bearer_token_env)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingSecret(self.api.bearer_token_env.clone()))?;
        self.api.bearer_token = token.trim().to_string();
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inews.host.trim().is_empty() {
            return Err(ConfigError::Invalid("inews.host must not be empty".into()));
        }
        if self.monitors().is_empty() {
            return Err(ConfigError::Invalid(
                "at least one monitor (or inews.rundown_path) is required".into(),
            ));
        }
        if self.download.concurrency == 0 {
            return Err(ConfigError::Invalid("download.concurrency must be > 0".into()));
        }
        if self.api.requests_per_window == 0 || self.api.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "api.requests_per_window and api.window_secs must be > 0".into(),
            ));
        }
        if self.download.max_attempts == 0 || self.fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry attempt counts must be > 0".into()));
        }
        Ok(())
    }

    /// Effective monitor list: the legacy single rundown first (as `DEFAULT`),
    /// then the `monitors` array. Unnamed monitors get `MONITOR_<n>`; every
    /// returned monitor has its `ap_filter` set.
    pub fn monitors(&self) -> Vec<MonitorConfig> {
        let inherited = self
            .monitor
            .as_ref()
            .map(|legacy| legacy.ap_filter.clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        if let (Some(legacy), Some(path)) = (&self.monitor, &self.inews.rundown_path) {
            out.push(MonitorConfig {
                name: "DEFAULT".to_string(),
                rundown_path: path.clone(),
                interval_seconds: legacy.interval_seconds,
                ap_filter: Some(legacy.ap_filter.clone()),
            });
        }
        for (i, m) in self.monitors.iter().enumerate() {
            let mut m = m.clone();
            if m.name.trim().is_empty() {
                m.name = format!("MONITOR_{}", i + 1);
            }
            m.ap_filter.get_or_insert_with(|| inherited.clone());
            out.push(m);
        }
        out
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.content.download_base_path.join(&self.content.state_file)
    }

    pub fn manifest_file_path(&self) -> PathBuf {
        self.content.download_base_path.join(&self.content.manifest_file)
    }

    pub fn index_file_path(&self) -> PathBuf {
        self.content.download_base_path.join(&self.content.index_file)
    }

    pub fn grace_period(&self) -> Duration {
        let secs = self.cleanup.grace_secs.unwrap_or_else(|| {
            self.monitors()
                .iter()
                .map(|m| m.interval_seconds)
                .min()
                .unwrap_or_else(default_interval)
        });
        Duration::from_secs(secs)
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            host = self.inews.host.as_str(),
            port = self.inews.port,
            user = self.inews.user.as_str(),
            monitors = self.monitors().len(),
            download_base = %self.content.download_base_path.display(),
            api_base = self.api.base_url.as_str(),
            token_env = self.api.bearer_token_env.as_str(),
            token_set = !self.api.bearer_token.is_empty(),
            concurrency = self.download.concurrency,
            grace_secs = self.grace_period().as_secs(),
            "Configuration loaded"
        );
    }
}

fn default_ftp_port() -> u16 {
    21
}
fn default_ftp_timeout() -> u64 {
    30
}
fn default_interval() -> u64 {
    30
}
fn default_download_base() -> PathBuf {
    PathBuf::from("Descargas")
}
fn default_state_file() -> PathBuf {
    PathBuf::from("content_state.json")
}
fn default_manifest_file() -> PathBuf {
    PathBuf::from("manifest.json")
}
fn default_index_file() -> PathBuf {
    PathBuf::from("index.csv")
}
fn default_api_base() -> String {
    "https://api.twitter.com".to_string()
}
fn default_token_env() -> String {
    "TWITTER_BEARER_TOKEN".to_string()
}
// Tweet lookup app-auth limit: 450 requests per 15 minutes.
fn default_requests_per_window() -> u32 {
    450
}
fn default_window_secs() -> u64 {
    900
}
fn default_max_wait_secs() -> u64 {
    60
}
fn default_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    4
}
fn default_download_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
