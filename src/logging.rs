//! Log setup for the binary.
//!
//! Logs go to a daily rolling file in the data directory so that command
//! output on stdout stays clean.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `issuedeck=debug`.
pub const LOG_ENV: &str = "ISSUEDECK_LOG";

const DEFAULT_FILTER: &str = "issuedeck=info";

/// Directory holding the log files.
pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("issuedeck").join("logs"))
}

fn filter(default: Option<&str>) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(default.unwrap_or(DEFAULT_FILTER)))
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber writing to `dir/issuedeck.log.<date>`.
///
/// `ISSUEDECK_LOG` wins over `default_filter`. Keep the returned guard alive
/// until exit or buffered lines are lost.
pub fn init(dir: &Path, default_filter: Option<&str>) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "issuedeck.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(default_filter))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_default_falls_back() {
    let filter = filter(Some("issuedeck=[[["));
    assert!(!filter.to_string().is_empty());
  }
}
