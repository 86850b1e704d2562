// Logging setup
//
// Everything logs through the `log` facade; env_logger is the backend.
// Verbosity comes from config.toml unless RUST_LOG is set.

use anyhow::{Context, Result};
use env_logger::{Builder, Target, WriteStyle};
use log::LevelFilter;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::Write;

use crate::config::DebugConfig;

/// How chatty the log output is. Errors are always printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Error,
    Warning,
    Message,
    Trivial,
}

impl Default for Verbosity {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Verbosity::Message
        } else {
            Verbosity::Warning
        }
    }
}

impl Verbosity {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Error => LevelFilter::Error,
            Verbosity::Warning => LevelFilter::Warn,
            Verbosity::Message => LevelFilter::Info,
            Verbosity::Trivial => LevelFilter::Trace,
        }
    }
}

fn write_style(colored: bool) -> WriteStyle {
    if colored {
        WriteStyle::Auto
    } else {
        WriteStyle::Never
    }
}

/// Initialize logging, optionally redirecting output to a log file
pub fn init(config: &DebugConfig) -> Result<()> {
    let mut builder = Builder::from_default_env();

    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(config.verbosity.level_filter());
    }
    builder.write_style(write_style(config.colored_output));

    if config.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.log_file)
            .with_context(|| format!("Failed to open log file: {}", config.log_file))?;

        writeln!(file, "=== Ray Tracer Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;

        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Logger already initialized")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_is_ordered_by_chattiness() {
        assert!(Verbosity::Error < Verbosity::Warning);
        assert!(Verbosity::Warning < Verbosity::Message);
        assert!(Verbosity::Message < Verbosity::Trivial);
    }

    #[test]
    fn verbosity_maps_to_level_filters() {
        assert_eq!(Verbosity::Error.level_filter(), LevelFilter::Error);
        assert_eq!(Verbosity::Warning.level_filter(), LevelFilter::Warn);
        assert_eq!(Verbosity::Message.level_filter(), LevelFilter::Info);
        assert_eq!(Verbosity::Trivial.level_filter(), LevelFilter::Trace);
    }
}
