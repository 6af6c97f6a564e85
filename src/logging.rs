//! Tracing setup. Logs go to stderr so `build` output on stdout stays
//! machine-readable; an optional daily-rotated JSON file sits alongside.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingSection};

pub const DEFAULT_FILTER: &str = "buildforge=info";
const LOG_FILE_PREFIX: &str = "buildforge.log";

/// `RUST_LOG` wins, then `--verbose`, then `[logging] filter`.
pub fn env_filter(section: &LoggingSection, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = if verbose {
        "buildforge=debug".to_string()
    } else {
        section
            .filter
            .clone()
            .unwrap_or_else(|| DEFAULT_FILTER.to_string())
    };
    EnvFilter::try_new(&directive).with_context(|| format!("Invalid log filter '{}'", directive))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(section: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(section, verbose)?;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(match section.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    });

    let guard = match &section.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_filter_is_used() {
        // RUST_LOG may be set by the test runner; only check the fallback
        // path when it is not.
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let section = LoggingSection {
            filter: Some("buildforge=warn".into()),
            ..Default::default()
        };
        let filter = env_filter(&section, false).unwrap();
        assert_eq!(filter.to_string(), "buildforge=warn");
        let verbose = env_filter(&section, true).unwrap();
        assert_eq!(verbose.to_string(), "buildforge=debug");
    }

    #[test]
    fn test_invalid_filter_is_an_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let section = LoggingSection {
            filter: Some("buildforge=notalevel".into()),
            ..Default::default()
        };
        assert!(env_filter(&section, false).is_err());
    }
}
