//! Structured logging setup for the launcher and workers.
//!
//! Supports two modes:
//! - Development: Pretty-printed human-readable logs
//! - Production: JSON-formatted logs for log aggregation
//!
//! Set `DPSYNC_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

pub const LOG_FORMAT_ENV: &str = "DPSYNC_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs for production.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV)
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize logging with the default level and the format from the
/// environment.
pub fn init() -> anyhow::Result<()> {
    init_with_level_and_format("info", LogFormat::from_env())
}

/// Initialize logging; `level` applies when `RUST_LOG` is unset.
///
/// Logs go to stderr so worker stdout stays free for rank-tagged output.
/// A second initialization in the same process is an error.
pub fn init_with_level_and_format(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Pretty => Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false),
        ),
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        ),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn log_format_from_env() {
        std::env::remove_var(LOG_FORMAT_ENV);
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

        std::env::set_var(LOG_FORMAT_ENV, "json");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::set_var(LOG_FORMAT_ENV, "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::set_var(LOG_FORMAT_ENV, "text");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

        std::env::remove_var(LOG_FORMAT_ENV);
    }

    #[test]
    fn second_init_is_reported() {
        let _ = init_with_level_and_format("warn", LogFormat::Pretty);
        assert!(init_with_level_and_format("warn", LogFormat::Json).is_err());
    }
}
