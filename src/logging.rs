//! Structured logging (C17).
//!
//! Grounded in `infrastructure/logging.rs`: console + rolling-file layers
//! composed on a `tracing_subscriber::Registry`, switchable between plain
//! and JSON formatting via [`crate::config::LoggingConfig`].

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;

const APP_NAME: &str = "pricewatch-core";

/// Directory log files are written under, relative to the executable.
#[must_use]
pub fn log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    exe_dir.join("logs")
}

/// Initialize logging from the given configuration. Returns a guard that
/// must be kept alive for the lifetime of the process when file output is
/// enabled, since the non-blocking writer flushes on drop.
pub fn init(config: &LoggingConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = Registry::default().with(env_filter);

    let guard = match (config.file_output, config.console_output) {
        (true, console) => {
            let log_dir = log_directory();
            std::fs::create_dir_all(&log_dir)
                .map_err(|e| anyhow!("failed to create log directory {log_dir:?}: {e}"))?;
            let appender = rolling::daily(&log_dir, format!("{APP_NAME}.log"));
            let (writer, guard) = non_blocking(appender);

            let file_layer = build_layer(writer, config.json_format, true);
            if console {
                let console_layer = build_layer(std::io::stdout, config.json_format, false);
                registry.with(file_layer).with(console_layer).init();
            } else {
                registry.with(file_layer).init();
            }
            Some(guard)
        }
        (false, true) => {
            let console_layer = build_layer(std::io::stdout, config.json_format, false);
            registry.with(console_layer).init();
            None
        }
        (false, false) => return Err(anyhow!("no logging output configured")),
    };

    info!(level = %config.level, json = config.json_format, "logging initialized");
    Ok(guard)
}

fn build_layer<W>(
    writer: W,
    json: bool,
    with_file_location: bool,
) -> Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let layer = fmt::Layer::new()
        .with_writer(writer)
        .with_target(with_file_location)
        .with_thread_ids(with_file_location)
        .with_file(with_file_location)
        .with_line_number(with_file_location);

    if json {
        Box::new(layer.json())
    } else {
        Box::new(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_directory_ends_with_logs() {
        assert!(log_directory().to_string_lossy().ends_with("logs"));
    }

    #[test]
    fn default_logging_config_has_both_outputs() {
        let c = LoggingConfig::default();
        assert!(c.console_output);
        assert!(c.file_output);
    }
}
