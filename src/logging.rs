/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LogFormat, LoggingSection};
use crate::error::{BulwarkError, Result};

/// Default filter when `RUST_LOG` is unset; covers every `bulwark*` target
pub fn default_directives(level: Level) -> String {
    format!("bulwark={level},tower_http={level}")
}

/// Initialize structured logging based on configuration
pub fn init_logging(config: &LoggingSection, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(log_level)))
        .map_err(|e| BulwarkError::Logging(format!("Failed to create log filter: {}", e)))?;

    match (&config.file, config.format) {
        (Some(log_path), _) => init_file_logging(log_path, env_filter),
        (None, LogFormat::Json) => init_json_logging(env_filter),
        (None, LogFormat::Compact) => init_stdout_logging(env_filter),
    }
}

fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| BulwarkError::Logging(e.to_string()))
}

/// One JSON object per line on stdout, for log shippers
fn init_json_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| BulwarkError::Logging(e.to_string()))
}

fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| BulwarkError::Logging(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| BulwarkError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        let directives = default_directives(Level::WARN);
        assert_eq!(directives, "bulwark=WARN,tower_http=WARN");
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_unwritable_log_file_is_reported() {
        let config = LoggingSection {
            file: Some("/nonexistent-dir/bulwark/log.json".into()),
            ..Default::default()
        };
        let err = init_logging(&config, false).unwrap_err();
        assert!(matches!(err, BulwarkError::Logging(_)));
    }
}
