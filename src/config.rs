use crate::parser::ParseMode;
use crate::record::Severity;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub index: IndexConfig,
    pub detector: DetectorConfig,
    pub summarizer: SummarizerConfig,
    pub alerts: AlertConfig,
    pub provider: Option<ProviderConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { hostname: "127.0.0.1".to_string(), port: 8000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub mode: ParseMode,
    /// Parser threads; 0 means one per CPU.
    pub workers: usize,
    pub queue_capacity: usize,
    pub record_retention_secs: i64,
    pub max_context_lines: usize,
    pub event_retention_secs: i64,
    pub max_summaries: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: ParseMode::Auto,
            workers: 0,
            queue_capacity: 1024,
            record_retention_secs: 3600,
            max_context_lines: 2000,
            event_retention_secs: 24 * 3600,
            max_summaries: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn worker_threads(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub max_templates: usize,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { max_templates: 50_000, snapshot_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub short_window_secs: i64,
    pub baseline_window_secs: i64,
    pub bucket_secs: i64,
    pub spike_multiplier: f64,
    pub min_spike_count: u64,
    pub min_baseline_rate: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            short_window_secs: 300,
            baseline_window_secs: 3600,
            bucket_secs: 1,
            spike_multiplier: 3.0,
            min_spike_count: 10,
            min_baseline_rate: 1.0,
        }
    }
}

impl DetectorConfig {
    pub fn short_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.short_window_secs)
    }

    pub fn baseline_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.baseline_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub coalesce_window_ms: u64,
    pub timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_prompt_chars: usize,
    pub max_tokens: u32,
    pub max_supersede: u32,
    /// How often the worker wakes to check for due batches.
    pub poll_interval_ms: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 60_000,
            timeout_ms: 10_000,
            retry_backoff_ms: 500,
            max_prompt_chars: 8_000,
            max_tokens: 512,
            max_supersede: 2,
            poll_interval_ms: 100,
        }
    }
}

impl SummarizerConfig {
    pub fn coalesce_window(&self) -> StdDuration {
        StdDuration::from_millis(self.coalesce_window_ms)
    }

    pub fn timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> StdDuration {
        StdDuration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub min_severity: Severity,
    pub history: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { min_severity: Severity::Error, history: 1000 }
    }
}

/// OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub completions_path: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            completions_path: "/v1/chat/completions".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

/// Upper bound for every configured window, one year.
pub const MAX_WINDOW_SECS: i64 = 366 * 24 * 3600;
const MAX_WINDOW_MS: u64 = MAX_WINDOW_SECS as u64 * 1000;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if d.bucket_secs <= 0 || d.short_window_secs <= 0 || d.baseline_window_secs <= 0 {
            return Err(ConfigError::Invalid("detector windows must be positive".into()));
        }
        if d.baseline_window_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::Invalid(format!(
                "detector windows must not exceed {MAX_WINDOW_SECS} seconds"
            )));
        }
        if d.short_window_secs >= d.baseline_window_secs {
            return Err(ConfigError::Invalid(
                "detector.short_window_secs must be shorter than baseline_window_secs".into(),
            ));
        }
        if d.short_window_secs < d.bucket_secs {
            return Err(ConfigError::Invalid("detector.bucket_secs exceeds the short window".into()));
        }
        if d.spike_multiplier <= 1.0 || !d.spike_multiplier.is_finite() {
            return Err(ConfigError::Invalid("detector.spike_multiplier must be > 1".into()));
        }
        if d.min_baseline_rate <= 0.0 {
            return Err(ConfigError::Invalid("detector.min_baseline_rate must be positive".into()));
        }
        if self.index.max_templates == 0 {
            return Err(ConfigError::Invalid("index.max_templates must be at least 1".into()));
        }
        if self.ingest.queue_capacity == 0 {
            return Err(ConfigError::Invalid("ingest.queue_capacity must be at least 1".into()));
        }
        if self.summarizer.timeout_ms == 0 || self.summarizer.max_prompt_chars == 0 {
            return Err(ConfigError::Invalid(
                "summarizer.timeout_ms and max_prompt_chars must be positive".into(),
            ));
        }
        let sm = &self.summarizer;
        let durations = [
            ("coalesce_window_ms", sm.coalesce_window_ms),
            ("timeout_ms", sm.timeout_ms),
            ("retry_backoff_ms", sm.retry_backoff_ms),
            ("poll_interval_ms", sm.poll_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms > MAX_WINDOW_MS) {
            return Err(ConfigError::Invalid(format!("summarizer.{name} must not exceed {MAX_WINDOW_MS} ms")));
        }
        Ok(())
    }
}

/// Loads a JSON config; a missing file yields defaults. Environment
/// overrides are applied last.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = resolve_path(path.as_ref());
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let cfg: Config = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        info!(path = %path.display(), "loaded config");
        cfg
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg)?;
    cfg.validate()?;
    Ok(cfg)
}

fn resolve_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if let Ok(home) = env::var("HOME") {
        if raw == "~" {
            return PathBuf::from(home);
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            return Path::new(&home).join(rest);
        }
    }
    path.to_path_buf()
}

fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    let base_url = env::var("LOGCRAFT_PROVIDER_BASE_URL").ok();
    let api_key = env::var("LOGCRAFT_PROVIDER_API_KEY").ok();
    let model = env::var("LOGCRAFT_PROVIDER_MODEL").ok();

    if base_url.is_some() || api_key.is_some() || model.is_some() {
        let provider = cfg.provider.get_or_insert_with(ProviderConfig::default);
        if let Some(value) = base_url {
            provider.base_url = value;
        }
        if let Some(value) = api_key {
            provider.api_key = value;
        }
        if let Some(value) = model {
            provider.model = value;
        }
    }
    if let Ok(bind) = env::var("LOGCRAFT_BIND") {
        apply_bind(cfg, &bind)?;
    }
    Ok(())
}

/// `host:port` or a bare port.
pub fn apply_bind(cfg: &mut Config, bind: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("invalid bind address: {bind}"));
    if let Some((host, port)) = bind.rsplit_once(':') {
        if host.is_empty() {
            return Err(invalid());
        }
        cfg.server.port = port.parse().map_err(|_| invalid())?;
        cfg.server.hostname = host.to_string();
        return Ok(());
    }
    cfg.server.port = bind.parse().map_err(|_| invalid())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let _guard = env_lock().lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.detector.short_window_secs, 300);
        assert_eq!(cfg.summarizer.timeout_ms, 10_000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let _guard = env_lock().lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logcraft.json");
        fs::write(&path, r#"{"detector":{"spike_multiplier":5.0},"ingest":{"mode":"json_lines"}}"#).unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.detector.spike_multiplier, 5.0);
        assert_eq!(cfg.detector.baseline_window_secs, 3600);
        assert_eq!(cfg.ingest.mode, ParseMode::JsonLines);
    }

    #[test]
    fn env_key_populates_provider() {
        let _guard = env_lock().lock().unwrap();
        std::env::set_var("LOGCRAFT_PROVIDER_API_KEY", "test-key");
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(dir.path().join("absent.json")).unwrap();
        std::env::remove_var("LOGCRAFT_PROVIDER_API_KEY");
        assert_eq!(cfg.provider.expect("provider").api_key, "test-key");
    }

    #[test]
    fn rejects_inverted_windows() {
        let mut cfg = Config::default();
        cfg.detector.short_window_secs = 7200;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_bind_env_is_an_error() {
        let _guard = env_lock().lock().unwrap();
        std::env::set_var("LOGCRAFT_BIND", "localhost:http");
        let dir = tempfile::tempdir().unwrap();
        let result = load(dir.path().join("absent.json"));
        std::env::remove_var("LOGCRAFT_BIND");
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("localhost:http")));
    }

    #[test]
    fn rejects_unbounded_windows() {
        let mut cfg = Config::default();
        cfg.summarizer.coalesce_window_ms = u64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.detector.baseline_window_secs = i64::MAX;
        cfg.detector.short_window_secs = i64::MAX - 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.summarizer.coalesce_window_ms = MAX_WINDOW_MS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bind_override_forms() {
        let mut cfg = Config::default();
        apply_bind(&mut cfg, "0.0.0.0:9000").unwrap();
        assert_eq!(cfg.server.hostname, "0.0.0.0");
        assert_eq!(cfg.server.port, 9000);
        apply_bind(&mut cfg, "9100").unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert!(apply_bind(&mut cfg, ":80").is_err());
    }
}
