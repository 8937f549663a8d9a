// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leader-gated collection of service-health counts.
//!
//! A fleet of `census` instances contend for a single distributed lock. The
//! holder periodically lists every service known to the directory, counts
//! instances by tag set and worst health status, and submits the counts to a
//! metrics sink as one batch per tick. When the lock is lost, polling stops
//! and the instance goes back to contending for it.

// Copyright 2024 Oxide Computer Company

use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod aggregate;
pub mod cmd;
pub mod consul;
pub mod datadog;
pub mod directory;
#[cfg(test)]
mod fakes;
pub mod leader;
pub mod lock;
pub mod logging;
pub mod poller;
pub mod sink;
pub mod trigger;

pub use aggregate::ServiceAggregate;
pub use consul::ConsulClient;
pub use consul::ConsulConfig;
pub use consul::ConsulDirectory;
pub use consul::ConsulLock;
pub use datadog::DatadogClient;
pub use datadog::DatadogConfig;
pub use directory::Directory;
pub use directory::DirectoryError;
pub use leader::LeaderGate;
pub use leader::LeaseState;
pub use lock::LeaderLock;
pub use lock::LockError;
pub use logging::ConfigLogging;
pub use poller::Poller;
pub use sink::MetricsSink;
pub use sink::SinkError;
pub use trigger::trigger;
pub use trigger::Listener;
pub use trigger::Trigger;

/// Errors running the collector.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to query the service directory")]
    Directory(#[from] DirectoryError),

    #[error("failed to operate the leader lock")]
    Lock(#[from] LockError),

    #[error("failed to submit metrics")]
    Sink(#[from] SinkError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("poll task did not run to completion")]
    PollerTask(#[from] tokio::task::JoinError),
}

/// Default key of the leader lock.
pub const DEFAULT_LOCK_KEY: &str = "census/.lock";

/// Default interval between polls.
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(10);

fn default_lock_key() -> String {
    DEFAULT_LOCK_KEY.to_string()
}

const fn default_collect_interval() -> Duration {
    DEFAULT_COLLECT_INTERVAL
}

/// Configuration for a `census` collector.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Key of the distributed lock that elects the active poller.
    #[serde(default = "default_lock_key")]
    pub lock_key: String,

    /// Interval between polls of the directory, e.g. `"10s"`.
    #[serde(default = "default_collect_interval", with = "humantime_duration")]
    pub collect_interval: Duration,

    /// How to reach the Consul agent.
    #[serde(default)]
    pub consul: ConsulConfig,

    /// How to reach Datadog.
    #[serde(default)]
    pub datadog: DatadogConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: ConfigLogging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_key: default_lock_key(),
            collect_interval: default_collect_interval(),
            consul: ConsulConfig::default(),
            datadog: DatadogConfig::default(),
            log: ConfigLogging::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("read \"{}\": {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("parse \"{}\": {}", path.display(), e))
        })
    }

    /// Check invariants that can't be expressed in the type.
    pub fn validate(&self) -> Result<(), Error> {
        if self.lock_key.trim().is_empty() {
            return Err(Error::Config("lock key must not be empty".into()));
        }
        if self.collect_interval.is_zero() {
            return Err(Error::Config(
                "collect interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

mod humantime_duration {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
