// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interval-driven poll loop.
//!
//! On every tick the loop lists the directory's services, aggregates each
//! service's instances by tag set and status, and submits the union of the
//! resulting points to the metrics sink in a single batch. Cancellation is
//! only observed between ticks; a cycle that has started runs to completion.

use crate::aggregate::ServiceAggregate;
use crate::directory::Directory;
use crate::sink::MetricsSink;
use crate::trigger::Listener;
use crate::Error;
use census_types::MetricPoint;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::trace;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;

/// Periodically aggregates directory health into metric batches.
#[derive(Clone)]
pub struct Poller {
    log: Logger,
    directory: Arc<dyn Directory>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        log: &Logger,
        directory: Arc<dyn Directory>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        let log = log.new(o!("component" => "poller"));
        Self { log, directory, sink, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run poll cycles until `cancel` fires.
    ///
    /// The first cycle starts one full interval after the call. If
    /// `iteration_limit` is non-zero, the loop returns after that many cycles.
    /// Any collaborator error ends the loop and is returned.
    pub async fn run(
        self,
        mut cancel: Listener,
        iteration_limit: usize,
    ) -> Result<(), Error> {
        let datacenter =
            self.directory.self_datacenter().await.map_err(|e| {
                error!(
                    self.log,
                    "failed to fetch datacenter";
                    "error" => %e,
                );
                e
            })?;
        info!(
            self.log,
            "starting poll loop";
            "datacenter" => &datacenter,
            "interval" => ?self.interval,
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await; // completes immediately

        let mut iterations = 0;
        loop {
            if iteration_limit != 0 && iterations >= iteration_limit {
                debug!(
                    self.log,
                    "iteration limit reached";
                    "iterations" => iterations,
                );
                return Ok(());
            }
            tokio::select! {
                biased;

                _ = cancel.fired() => {
                    debug!(self.log, "poll loop cancelled");
                    return Ok(());
                }
                _ = timer.tick() => {}
            }
            // Cancellation may have raced with the tick.
            if cancel.is_fired() {
                debug!(self.log, "poll loop cancelled");
                return Ok(());
            }
            if let Err(e) = self.poll_once(&datacenter).await {
                error!(self.log, "poll cycle failed"; "error" => %e);
                return Err(e);
            }
            iterations += 1;
        }
    }

    /// Perform a single poll cycle, returning the number of points submitted.
    pub async fn poll_once(&self, datacenter: &str) -> Result<usize, Error> {
        let services = self.directory.list_services().await?;
        let mut aggregates = Vec::with_capacity(services.len());
        for service in services.keys() {
            let instances =
                self.directory.service_health(service, None, false).await?;
            for instance in &instances {
                for check in &instance.checks {
                    if check.status().is_none() {
                        debug!(
                            self.log,
                            "treating unrecognized check status as passing";
                            "service" => service,
                            "check" => &check.name,
                            "status" => &check.status,
                        );
                    }
                }
            }
            let aggregate =
                ServiceAggregate::from_instances(service, &instances);
            trace!(
                self.log,
                "aggregated service";
                "service" => service,
                "instances" => instances.len(),
                "buckets" => aggregate.buckets().len(),
            );
            aggregates.push(aggregate);
        }

        let timestamp = chrono::Utc::now().timestamp();
        let batch: Vec<MetricPoint> = aggregates
            .iter()
            .flat_map(|aggregate| aggregate.to_points(datacenter, timestamp))
            .collect();
        self.sink.submit(&batch).await?;
        debug!(
            self.log,
            "submitted batch";
            "services" => services.len(),
            "points" => batch.len(),
        );
        Ok(batch.len())
    }
}
