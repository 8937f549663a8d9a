// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Count Consul service instances by health and report them to Datadog.
//!
//! Any number of copies may run at once; a Consul lock makes sure only one
//! of them reports at a time.

use anyhow::anyhow;
use anyhow::Context;
use census_collector::cmd::fatal;
use census_collector::cmd::CmdError;
use census_collector::trigger;
use census_collector::Config;
use census_collector::ConsulClient;
use census_collector::ConsulDirectory;
use census_collector::ConsulLock;
use census_collector::DatadogClient;
use census_collector::LeaderGate;
use census_collector::Poller;
use census_collector::SinkError;
use census_collector::Trigger;
use clap::Parser;
use futures::StreamExt;
use libc::SIGINT;
use libc::SIGQUIT;
use libc::SIGTERM;
use signal_hook::low_level::signal_name;
use signal_hook_tokio::Signals;
use slog::info;
use slog::Logger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Report the health of every Consul service to Datadog.
#[derive(Debug, Parser)]
#[clap(name = "census", version)]
struct Args {
    /// Path to a TOML configuration file
    #[clap(long, short, action)]
    config: Option<PathBuf>,

    /// Consul KV key used to elect the reporting instance
    #[clap(long, env = "CENSUS_LOCK_KEY", action)]
    lock_key: Option<String>,

    /// Time between polls, e.g. "10s" or "1m"
    #[clap(
        long,
        env = "CENSUS_COLLECT_INTERVAL",
        value_parser = humantime::parse_duration,
    )]
    collect_interval: Option<Duration>,

    /// Address of the Consul agent's HTTP API
    #[clap(long, env = "CONSUL_HTTP_ADDR", action)]
    consul_address: Option<String>,

    /// Consul ACL token
    #[clap(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true, action)]
    consul_token: Option<String>,

    /// Datadog API key
    #[clap(long, env = "DATADOG_API_KEY", hide_env_values = true, action)]
    datadog_api_key: Option<String>,

    /// Base URL of the Datadog API
    #[clap(long, env = "DATADOG_API_URL", action)]
    datadog_api_url: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(lock_key) = self.lock_key {
            config.lock_key = lock_key;
        }
        if let Some(interval) = self.collect_interval {
            config.collect_interval = interval;
        }
        if let Some(address) = self.consul_address {
            config.consul.address = address;
        }
        if let Some(token) = self.consul_token {
            config.consul.token = Some(token);
        }
        if let Some(api_key) = self.datadog_api_key {
            config.datadog.api_key = Some(api_key);
        }
        if let Some(api_url) = self.datadog_api_url {
            config.datadog.api_url = api_url;
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let mut args = match Args::try_parse() {
        Ok(args) => args,
        // --help and --version
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let rendered = err.to_string();
            let message = rendered.trim_start_matches("error: ").trim_end();
            return Err(CmdError::Usage(format!(
                "parsing arguments: {}",
                message
            )));
        }
    };
    let mut config = match args.config.take() {
        Some(path) => Config::from_file(path)
            .map_err(|e| CmdError::Failure(anyhow!(e)))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().map_err(|e| CmdError::Failure(anyhow!(e)))?;

    let log = config
        .log
        .to_logger("census")
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;
    info!(log, "starting census"; "version" => env!("CARGO_PKG_VERSION"));

    run(&log, config).await.map_err(CmdError::Failure)
}

async fn run(log: &Logger, config: Config) -> Result<(), anyhow::Error> {
    let api_key = config.datadog.api_key.as_deref().ok_or_else(|| {
        anyhow!(
            "a Datadog API key is required \
             (--datadog-api-key or DATADOG_API_KEY)"
        )
    })?;
    let sink = DatadogClient::new(&config.datadog.api_url, api_key)
        .context("failed to build Datadog client")?;
    sink.validate().await.map_err(|e| match e {
        SinkError::InvalidApiKey => anyhow!("invalid Datadog API key"),
        e => anyhow!(e).context("failed to validate Datadog API key"),
    })?;

    let consul = ConsulClient::new(&config.consul)
        .context("failed to build Consul client")?;
    let directory = Arc::new(ConsulDirectory::new(consul.clone()));
    let lock = ConsulLock::new(log, consul, &config.lock_key);
    let poller = Poller::new(
        log,
        directory,
        Arc::new(sink),
        config.collect_interval,
    );
    let gate = LeaderGate::new(log, Box::new(lock), poller);

    let signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])
        .context("failed to register signal handlers")?;
    let signals_handle = signals.handle();
    let (stop, stop_rx) = trigger();
    let signal_task =
        tokio::spawn(forward_signals(log.clone(), signals, stop));

    let result = gate.run(stop_rx, None).await;
    signals_handle.close();
    let _ = signal_task.await;
    result?;
    info!(log, "census stopped");
    Ok(())
}

async fn forward_signals(log: Logger, mut signals: Signals, stop: Trigger) {
    while let Some(signal) = signals.next().await {
        if stop.fire() {
            info!(
                log,
                "received signal, stopping";
                "signal" => signal_name(signal).unwrap_or("unknown"),
            );
        }
    }
}
