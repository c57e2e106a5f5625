//! Subscriber setup shared by both executables

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `level` accepts anything `EnvFilter` understands, e.g. `debug` or
/// `muxtun=trace,info`.
pub fn init(level: &str, format: LogFormat) -> crate::Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level '{}': {}", level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    installed.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
}

/// Install the subscriber from config, letting a command line level win
pub fn init_from_config(config: &LoggingConfig, level_override: Option<&str>) -> crate::Result<()> {
    init(level_override.unwrap_or(&config.level), config.format)
}
