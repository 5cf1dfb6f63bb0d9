//! Dual-sink logging: a persistent file at maximum detail plus a console whose level follows
//! the verbosity flag.

use anyhow::{Context, Result};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::OutputConfig;

/// Console level: INFO by default, DEBUG with `-v`, TRACE with `-vv` and above.
#[must_use]
pub fn console_level(verbose: u8) -> tracing::level_filters::LevelFilter {
    match verbose {
        0 => tracing::level_filters::LevelFilter::INFO,
        1 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    }
}

fn open_log_file(path: &std::path::Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {:?}", path))
}

/// Installs the global subscriber. Failing to open the log file leaves the console sink in
/// place and is reported as a warning.
pub fn init(output: &OutputConfig) -> Result<()> {
    let console_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(console_level(output.verbose).into())
        .from_env_lossy();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout)
        .with_filter(console_filter);
    let mut file_error = None;
    let file_layer = match output.log_file.as_deref().map(open_log_file) {
        Some(Ok(file)) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_filter(tracing::level_filters::LevelFilter::TRACE),
        ),
        Some(Err(error)) => {
            file_error = Some(error);
            None
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;
    if let Some(error) = file_error {
        tracing::warn!("file logging disabled: {:#}", error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_console_level() {
        assert_eq!(console_level(0), tracing::level_filters::LevelFilter::INFO);
        assert_eq!(console_level(1), tracing::level_filters::LevelFilter::DEBUG);
        assert_eq!(console_level(5), tracing::level_filters::LevelFilter::TRACE);
    }

    #[test]
    fn log_file_is_appended() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sync.log");
        std::fs::write(&path, "earlier\n")?;
        use std::io::Write;
        writeln!(open_log_file(&path)?, "later")?;
        assert_eq!(std::fs::read_to_string(&path)?, "earlier\nlater\n");
        Ok(())
    }

    #[test]
    fn unwritable_log_location_is_an_error() {
        assert!(open_log_file(std::path::Path::new("/nonexistent/dir/sync.log")).is_err());
    }
}
