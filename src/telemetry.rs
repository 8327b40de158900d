/// Logging setup
///
/// One `tracing_subscriber` registry: an env filter (RUST_LOG wins over
/// the configured level), a fmt layer in json or pretty form, and a
/// non-blocking writer targeting either stdout or a rolling log file.
/// Hot loops pace their progress lines through `ProgressSampler`.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// "trace" through "error"; the RUST_LOG env var takes precedence
    pub log_level: String,
    /// "json" or "pretty"
    pub log_format: String,
    /// None logs to stdout
    pub log_file: Option<String>,
    /// "daily", "hourly", or "never"
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("RUSTYLIGHT_LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("RUSTYLIGHT_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

/// Install the global tracing subscriber. A subscriber installed earlier,
/// whether by the embedding application or a previous call, is left in
/// place and this returns without error.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (writer, guard): (NonBlocking, WorkerGuard) = match &config.log_file {
        Some(log_file) => {
            let path = std::path::Path::new(log_file);
            let directory = path
                .parent()
                .ok_or("log file path has no parent directory")?;
            let prefix = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or("log file path has no file name")?;
            let appender = match config.rotation.as_str() {
                "hourly" => rolling::hourly(directory, prefix),
                "never" => rolling::never(
                    directory,
                    path.file_name().ok_or("log file path has no file name")?,
                ),
                _ => rolling::daily(directory, prefix),
            };
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.log_format == "json" {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(writer),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        // The guard flushes the writer on drop; the subscriber is global,
        // so the guard must live for the rest of the process
        std::mem::forget(guard);
    }
    Ok(())
}

/// Paced progress logging for hot loops: `tick` is true on the first
/// call and then once every `interval` calls.
pub struct ProgressSampler {
    count: AtomicU64,
    interval: u64,
}

impl ProgressSampler {
    pub fn new(interval: u64) -> ProgressSampler {
        ProgressSampler {
            count: AtomicU64::new(0),
            interval: interval.max(1),
        }
    }

    pub fn tick(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) % self.interval == 0
    }

    /// Total ticks observed so far
    pub fn seen(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_sampler_paces_output() {
        let sampler = ProgressSampler::new(4);
        assert!(sampler.tick());
        assert!(!sampler.tick());
        assert!(!sampler.tick());
        assert!(!sampler.tick());
        assert!(sampler.tick());
        assert_eq!(sampler.seen(), 5);
    }

    #[test]
    fn test_progress_sampler_interval_floor() {
        let sampler = ProgressSampler::new(0);
        assert!(sampler.tick());
        assert!(sampler.tick());
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(TelemetryConfig::default()).unwrap();
        init_tracing(TelemetryConfig::default()).unwrap();
    }

    #[test]
    fn test_bad_log_file_path_is_an_error() {
        let config = TelemetryConfig {
            log_file: Some("/".to_string()),
            ..TelemetryConfig::default()
        };
        assert!(init_tracing(config).is_err());
    }
}
