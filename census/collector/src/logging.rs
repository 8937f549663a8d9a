// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration (the `[log]` table of the configuration file).

use serde::Deserialize;
use serde::Serialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::fs::OpenOptions;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to initialize logging: {0}")]
pub struct LoggingError(String);

/// Where and how verbosely to log.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },

    /// Newline-delimited JSON records written to `path`.
    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: String,
        if_exists: ConfigLoggingIfExists,
    },
}

impl Default for ConfigLogging {
    fn default() -> Self {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

impl ConfigLogging {
    /// Create the root logger, tagged with `name`.
    pub fn to_logger<S: Into<String>>(
        &self,
        name: S,
    ) -> Result<Logger, LoggingError> {
        let name = name.into();
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator =
                    slog_term::TermDecorator::new().stderr().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, name, drain))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true).create(true);
                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }
                let drain = log_drain_for_file(&open_options, Path::new(path))?;
                Ok(async_root_logger(*level, name, drain))
            }
        }
    }
}

// The terminal and file drains aren't safe to share across threads on their
// own, so both go behind slog-async.
fn async_root_logger<T>(
    level: ConfigLoggingLevel,
    name: String,
    drain: T,
) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let pid = std::process::id();
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!("name" => name, "pid" => pid))
}

fn log_drain_for_file(
    open_options: &OpenOptions,
    path: &Path,
) -> Result<slog::Fuse<slog_json::Json<std::fs::File>>, LoggingError> {
    let open_error = |e: std::io::Error| {
        LoggingError(format!("open log file \"{}\": {}", path.display(), e))
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(open_error)?;
    }
    let file = open_options.open(path).map_err(open_error)?;

    // Let whoever is watching stderr know where the log went.
    eprintln!("note: configured to log to \"{}\"", path.display());
    Ok(slog_json::Json::new(file).add_default_keys().build().fuse())
}
