use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to compact.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

/// Where formatted events are written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Append to a file. Used while a terminal session is being wrapped so
    /// nothing is ever written to the user's screen.
    File(PathBuf),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "trail_ship" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
    pub target: LogTarget,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Compact,
            target: LogTarget::Stderr,
        }
    }
}

impl TelemetryConfig {
    /// Build from the textual `level`/`format` pair found in config files.
    pub fn from_names(level: &str, format: &str) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            format: LogFormat::parse(format),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Returned by [`init_telemetry`]. Keep it alive for the life of the process.
#[derive(Debug)]
pub struct TelemetryGuard {
    log_file: Option<PathBuf>,
    installed: bool,
}

impl TelemetryGuard {
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// False when a global subscriber was already set (second init).
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Initialize the telemetry subsystem. Calling it twice leaves the first
/// subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

    let (layer, log_file) = match &config.target {
        LogTarget::Stderr => (
            build_layer(config.format, std::io::stderr, true, env_filter),
            None,
        ),
        LogTarget::File(path) => {
            let file = open_append(path)?;
            (
                build_layer(config.format, Mutex::new(file), false, env_filter),
                Some(path.clone()),
            )
        }
    };

    let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();

    Ok(TelemetryGuard { log_file, installed })
}

fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

fn build_layer<W>(
    format: LogFormat,
    writer: W,
    ansi: bool,
    filter: EnvFilter,
) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);
    match format {
        LogFormat::Json => base.json().with_span_list(true).with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}

fn open_append(path: &Path) -> Result<File, TelemetryError> {
    let open = || -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| TelemetryError::OpenLogFile {
        path: path.to_path_buf(),
        source,
    })
}
