//! Logging setup.
//!
//! The subscriber is built from the `[application]` section of [`BenchConfig`]:
//! `log_level`, `log_format` (pretty, compact or json), `log_spans`, `log_source` and
//! `log_color`. `RUST_LOG`, when set, replaces the configured level filter.
//!
//! ```no_run
//! use spectral_bench::{config::BenchConfig, tracing_setup};
//!
//! # fn main() -> spectral_bench::error::AppResult<()> {
//! let config = BenchConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!(port = "/dev/ttyUSB0", "bench ready");
//! # Ok(())
//! # }
//! ```

use crate::config::BenchConfig;
use crate::error::{AppResult, BenchError};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Event layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, coloured when enabled
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines
    Json,
}

/// Subscriber settings resolved from the bench configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Maximum level when `RUST_LOG` is unset
    pub level: Level,
    /// Event layout
    pub format: LogFormat,
    /// Emit span NEW/CLOSE events
    pub spans: bool,
    /// Include file and line
    pub source: bool,
    /// ANSI colours; pretty output only
    pub color: bool,
}

impl LogSettings {
    /// Resolve the `[application]` section
    pub fn from_config(config: &BenchConfig) -> AppResult<Self> {
        let app = &config.application;
        let format = parse_log_format(&app.log_format)?;
        Ok(Self {
            level: parse_log_level(&app.log_level)?,
            format,
            spans: app.log_spans,
            source: app.log_source,
            color: app.log_color && format == LogFormat::Pretty,
        })
    }

    fn span_events(&self) -> FmtSpan {
        if self.spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// Calling it again once a subscriber is installed is a no-op.
pub fn init_from_config(config: &BenchConfig) -> AppResult<()> {
    let settings = LogSettings::from_config(config)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_string().to_lowercase()));

    let base = fmt::layer()
        .with_span_events(settings.span_events())
        .with_file(settings.source)
        .with_line_number(settings.source)
        .with_ansi(settings.color);
    let layer = match settings.format {
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_filter(filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("global default trace dispatcher has already been set") => {
            Ok(())
        }
        Err(e) => Err(BenchError::Configuration(format!(
            "cannot install log subscriber: {e}"
        ))),
    }
}

/// Parse a level name, case-insensitively
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    level.parse::<Level>().map_err(|_| {
        BenchError::Configuration(format!(
            "unknown log level '{level}' (trace, debug, info, warn, error)"
        ))
    })
}

/// Parse a format name, case-insensitively
pub fn parse_log_format(format: &str) -> AppResult<LogFormat> {
    match format.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        _ => Err(BenchError::Configuration(format!(
            "unknown log format '{format}' (pretty, compact, json)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_in_any_case() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Warn").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn formats_parse() {
        assert_eq!(parse_log_format("JSON").unwrap(), LogFormat::Json);
        assert_eq!(parse_log_format("compact").unwrap(), LogFormat::Compact);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn settings_follow_application_section() {
        let mut config = BenchConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = "json".to_string();
        config.application.log_spans = true;
        config.application.log_source = true;

        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
        assert!(settings.source);
        // colour only applies to pretty output
        assert!(!settings.color);
    }

    #[test]
    fn defaults_give_coloured_pretty_info() {
        let settings = LogSettings::from_config(&BenchConfig::default()).unwrap();
        assert_eq!(
            settings,
            LogSettings {
                level: Level::INFO,
                format: LogFormat::Pretty,
                spans: false,
                source: false,
                color: true,
            }
        );
    }

    #[test]
    fn bad_level_is_a_configuration_error() {
        let mut config = BenchConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            init_from_config(&config),
            Err(BenchError::Configuration(_))
        ));
    }
}
