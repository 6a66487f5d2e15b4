//! Layered configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`TrailConfig::default()`]
//! 2. If `$XDG_CONFIG_HOME/trail/config.toml` exists, deep-merge it over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Components receive the section they need; nothing reads this lazily.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub logging: LoggingConfig,
    pub interceptor: InterceptorConfig,
    pub telemetry: TelemetrySettings,
    pub gateway: GatewayConfig,
    pub loki: LokiConfig,
    pub follower: FollowerConfig,
    pub rollup: RollupConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Session log root. A leading `~` expands to `$HOME`.
    pub root: String,
    /// Days to keep session directories. Negative keeps everything.
    pub retention_days: i64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            root: "~/.trail/sessions".into(),
            retention_days: 90,
        }
    }
}

impl LoggingConfig {
    pub fn root_dir(&self) -> PathBuf {
        expand_home(&self.root)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Retries for an interrupted or would-block write before the log is
    /// declared unwritable.
    pub transient_retry_limit: u32,
    pub forward_signals: bool,
    /// Environment variables copied into the session start record.
    pub env_whitelist: Vec<String>,
    /// Run `<program> --version` before the session and record the answer.
    pub query_version: bool,
    pub version_timeout_ms: u64,
    /// Hand the finished log to a detached `trail ship`.
    pub ship_on_exit: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            transient_retry_limit: 3,
            forward_signals: true,
            env_whitelist: ["SHELL", "TERM", "LANG", "LC_ALL", "PATH", "HOME"]
                .into_iter()
                .map(String::from)
                .collect(),
            query_version: true,
            version_timeout_ms: 2000,
            ship_on_exit: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub level: String,
    /// `json`, `pretty` or `compact`.
    pub format: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    pub request_timeout_secs: u64,
    pub max_batch: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            endpoint: "/ingest".into(),
            request_timeout_secs: 30,
            max_batch: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LokiConfig {
    pub url: String,
    pub push_path: String,
    pub job: String,
    pub labels: BTreeMap<String, String>,
    pub auth_token: Option<String>,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3100".into(),
            push_path: "/loki/api/v1/push".into(),
            job: "trail-sessions".into(),
            labels: BTreeMap::from([("component".to_string(), "trail".to_string())]),
            auth_token: None,
        }
    }
}

impl LokiConfig {
    pub fn push_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.push_path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Generic,
    Loki,
}

impl std::str::FromStr for Destination {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "http" => Ok(Self::Generic),
            "loki" => Ok(Self::Loki),
            other => Err(format!("unknown destination: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    pub destination: Destination,
    /// Generic-mode URL. Empty means the local gateway.
    pub endpoint: String,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub include_payload: bool,
    /// Ship existing records of newly discovered sessions, not just new ones.
    pub from_beginning: bool,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub hold_cooldown_secs: u64,
    /// Cursor database. Empty means `<root>/.follower.db`.
    pub state_db: String,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            destination: Destination::Generic,
            endpoint: String::new(),
            poll_interval_ms: 2000,
            batch_size: 200,
            include_payload: false,
            from_beginning: true,
            timeout_secs: 10,
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            hold_cooldown_secs: 60,
            state_db: String::new(),
        }
    }
}

impl FollowerConfig {
    pub fn state_db_path(&self, root: &Path) -> PathBuf {
        if self.state_db.is_empty() {
            root.join(".follower.db")
        } else {
            expand_home(&self.state_db)
        }
    }

    pub fn endpoint_url(&self, gateway: &GatewayConfig) -> String {
        if self.endpoint.is_empty() {
            let host = if gateway.host == "0.0.0.0" {
                "127.0.0.1"
            } else {
                gateway.host.as_str()
            };
            format!("http://{host}:{}{}", gateway.port, gateway.endpoint)
        } else {
            self.endpoint.clone()
        }
    }
}

/// USD per thousand tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub default_tokens_per_byte: f64,
    /// Model-family overrides of the byte-to-token ratio.
    pub tokens_per_byte: BTreeMap<String, f64>,
    /// Model prefix to rate.
    pub rates: BTreeMap<String, Rate>,
    /// Used when no prefix matches. Absent means "unknown cost".
    pub default_rate: Option<Rate>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            default_tokens_per_byte: 0.25,
            tokens_per_byte: BTreeMap::new(),
            rates: BTreeMap::from([
                (
                    "claude-3-5-haiku".to_string(),
                    Rate { input_per_1k: 0.0008, output_per_1k: 0.004 },
                ),
                (
                    "claude-3-5-sonnet".to_string(),
                    Rate { input_per_1k: 0.003, output_per_1k: 0.015 },
                ),
                (
                    "claude-3-opus".to_string(),
                    Rate { input_per_1k: 0.015, output_per_1k: 0.075 },
                ),
                (
                    "claude-sonnet-4".to_string(),
                    Rate { input_per_1k: 0.003, output_per_1k: 0.015 },
                ),
                (
                    "claude-opus-4".to_string(),
                    Rate { input_per_1k: 0.015, output_per_1k: 0.075 },
                ),
            ]),
            default_rate: None,
        }
    }
}

/// Resolve `$XDG_CONFIG_HOME/trail/config.toml`, falling back to `~/.config`.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"));
    base.join("trail").join("config.toml")
}

pub fn load_config() -> Result<TrailConfig> {
    load_config_from_path(&config_path())
}

/// Load config from a specific path with env var overrides.
///
/// A missing file yields defaults; an unparsable one is an error.
pub fn load_config_from_path(path: &Path) -> Result<TrailConfig> {
    let defaults = serde_json::to_value(TrailConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = toml::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: TrailConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides(config: &mut TrailConfig) {
    if let Some(v) = read_env_string("TRAIL_LOG_ROOT") {
        config.logging.root = v;
    }
    if let Some(v) = read_env_parsed::<i64>("TRAIL_RETENTION_DAYS") {
        config.logging.retention_days = v;
    }
    if let Some(v) = read_env_string("TRAIL_LOG_LEVEL") {
        config.telemetry.level = v;
    }
    if let Some(v) = read_env_string("LOKI_URL") {
        config.loki.url = v;
    }
    if let Some(v) = read_env_string("LOKI_JOB") {
        config.loki.job = v;
    }
    if let Some(v) = read_env_string("TRAIL_GATEWAY_HOST") {
        config.gateway.host = v;
    }
    if let Some(v) = read_env_u16("TRAIL_GATEWAY_PORT", 1, 65535) {
        config.gateway.port = v;
    }
    if let Some(v) = read_env_string("TRAIL_FOLLOW_ENDPOINT") {
        config.follower.endpoint = v;
    }
    if let Some(v) = read_env_parsed::<Destination>("TRAIL_FOLLOW_DESTINATION") {
        config.follower.destination = v;
    }
    if let Some(v) = read_env_parsed::<bool>("TRAIL_SHIP_ON_EXIT") {
        config.interceptor.ship_on_exit = v;
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let result = val.parse().ok();
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        home_dir()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(path)
    }
}
