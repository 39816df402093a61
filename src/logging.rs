//! Logging setup shared by the server, the CLI and the built-in worker.
//!
//! # Environment Variables
//!
//! - `RELAYVISOR_LOG` - Log filter directive (overrides RUST_LOG)
//! - `RELAYVISOR_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `RELAYVISOR_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RELAYVISOR_LOG_FILE` - Path to a log file written next to stderr
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use relayvisor::logging::{LogConfig, init};
//!
//! init(LogConfig::for_server().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const DEFAULT_LOG_FILE: &str = "relayvisor.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation schedule for the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" | "none" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Build one with the presets and `with_*` methods, then pass it to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no filter directive is set (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file; stderr is always written
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Emit a record when spans close, with their timing
    pub span_events: bool,
    /// Filter directive such as `relayvisor::pool=debug` (overrides level)
    pub filter: Option<String>,
    pub show_target: bool,
    /// Thread names identify stderr drains and reapers, so they are on for the server.
    pub show_thread_names: bool,
    /// Colors on stderr; files never get ANSI escapes
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_names: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for `serve`: compact lines with thread names.
    pub fn for_server() -> Self {
        Self {
            format: LogFormat::Compact,
            show_thread_names: true,
            ..Self::default()
        }
    }

    /// Preset for one-shot commands: warnings only, no targets.
    pub fn for_cli() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    /// Apply `-v`/`-q` counts on top of the preset level.
    ///
    /// Each `-v` raises the level one step; `-q` drops to errors only.
    pub fn with_verbosity(mut self, verbose: u8, quiet: bool) -> Self {
        if quiet {
            self.level = Level::ERROR;
            return self;
        }
        for _ in 0..verbose {
            self.level = match self.level {
                Level::ERROR => Level::WARN,
                Level::WARN => Level::INFO,
                Level::INFO => Level::DEBUG,
                _ => Level::TRACE,
            };
        }
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Apply `RELAYVISOR_LOG*` and `RUST_LOG` from the environment.
    ///
    /// A filter already set on the config wins over the environment; the
    /// level variable only applies when no filter is set at all.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("RELAYVISOR_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok()
                .filter(|f| !f.is_empty());
        }

        if self.filter.is_none()
            && let Some(level) = std::env::var("RELAYVISOR_LOG_LEVEL")
                .ok()
                .and_then(|s| parse_level(&s))
        {
            self.level = level;
        }

        if let Ok(format) = std::env::var("RELAYVISOR_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("RELAYVISOR_LOG_FILE")
            && !path.is_empty()
        {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    /// One formatting layer writing to `writer`.
    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_target(self.show_target)
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.boxed(),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_LOG_FILE);
        Some(RollingFileAppender::new(self.rotation.into(), dir, file_name))
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber: stderr, plus the log file when configured.
///
/// Call once at startup; later calls are ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, config.ansi)];
    if let Some(appender) = config.file_appender() {
        layers.push(config.layer(appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
