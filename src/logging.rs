use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "tabsync.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. When file logging is enabled
/// the returned guard must stay alive for buffered lines to be flushed.
pub fn init_tracing(config: &LoggingConfig, data_dir: &Path) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?;

  if config.file {
    let appender = tracing_appender::rolling::daily(data_dir.join("logs"), LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
      .with_writer(writer)
      .with_ansi(false)
      .with_target(true);

    tracing_subscriber::registry()
      .with(filter)
      .with(layer)
      .try_init()
      .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
    Ok(Some(guard))
  } else {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    tracing_subscriber::registry()
      .with(filter)
      .with(layer)
      .try_init()
      .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
    Ok(None)
  }
}
