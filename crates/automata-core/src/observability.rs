//! Observability bootstrap for Automata services.
//!
//! Structured logging with consistent fields across every service binary.
//! Call [`init_logging`] once at startup; the output encoder and threshold
//! come from the `LOG_FORMAT` and `LOG_LEVEL` environment variables (or the
//! explicit arguments).

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    #[default]
    Json,
    /// Human-readable logs (for development).
    Text,
}

impl LogFormat {
    /// Parses a format name; unknown values fall back to the default (json).
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            _ => Self::Json,
        }
    }

    /// Reads the format from `LOG_FORMAT`, defaulting to json.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Log level threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Everything, including per-message broker traffic.
    Debug,
    /// Normal operational logging.
    #[default]
    Info,
    /// Degraded-but-working conditions.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Parses a level name; unknown values fall back to the default (info).
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Self::Debug,
            "WARN" => Self::Warn,
            "ERROR" => Self::Error,
            _ => Self::Info,
        }
    }

    /// Reads the level from `LOG_LEVEL`, defaulting to info.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    fn as_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times; subsequent
/// calls are no-ops. `RUST_LOG` takes precedence over the `level` argument
/// when set, so per-crate overrides keep working.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer())
                    .init();
            }
        }
    });
}

/// Initializes logging from `LOG_FORMAT` and `LOG_LEVEL`.
pub fn init_logging_from_env() {
    init_logging(LogFormat::from_env(), LogLevel::from_env());
}
