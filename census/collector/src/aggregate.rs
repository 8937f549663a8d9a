// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregation of instance health into per-tag-set status counts.
//!
//! Each instance of a service is classified by its worst health check, and
//! counted in a bucket keyed by its canonical [`TagSet`]. Every bucket then
//! yields one [`MetricPoint`] per [`Status`], including statuses with a count
//! of zero, so consumers see explicit zeros rather than gaps.

use census_types::HealthCheck;
use census_types::MetricPoint;
use census_types::ServiceInstance;
use census_types::Status;
use census_types::TagSet;
use std::collections::BTreeMap;

/// The name of every metric point we emit.
pub const METRIC_NAME: &str = "consul.service.count";

/// Classify a set of health checks by the worst status among them.
///
/// Precedence is critical, then warning, then passing. A status string we
/// don't recognize counts as neither critical nor warning, so an instance
/// with no checks, or only unrecognized ones, is passing.
pub fn resolve_status<'a, I>(checks: I) -> Status
where
    I: IntoIterator<Item = &'a HealthCheck>,
{
    let mut worst = Status::Passing;
    for check in checks {
        match check.status() {
            Some(Status::Critical) => return Status::Critical,
            Some(Status::Warning) => worst = Status::Warning,
            Some(Status::Passing) | None => {}
        }
    }
    worst
}

/// Per-status instance counts for one bucket.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatusCounts {
    pub critical: u64,
    pub warning: u64,
    pub passing: u64,
}

impl StatusCounts {
    pub fn get(&self, status: Status) -> u64 {
        match status {
            Status::Critical => self.critical,
            Status::Warning => self.warning,
            Status::Passing => self.passing,
        }
    }

    pub fn increment(&mut self, status: Status) {
        match status {
            Status::Critical => self.critical += 1,
            Status::Warning => self.warning += 1,
            Status::Passing => self.passing += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.critical + self.warning + self.passing
    }
}

/// The buckets for one service, for one tick.
#[derive(Clone, Debug)]
pub struct ServiceAggregate {
    service: String,
    buckets: BTreeMap<TagSet, StatusCounts>,
}

impl ServiceAggregate {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), buckets: BTreeMap::new() }
    }

    /// Aggregate a list of instances of `service`.
    pub fn from_instances<'a, I>(
        service: impl Into<String>,
        instances: I,
    ) -> Self
    where
        I: IntoIterator<Item = &'a ServiceInstance>,
    {
        let mut aggregate = Self::new(service);
        for instance in instances {
            aggregate.observe(instance);
        }
        aggregate
    }

    /// Count one instance in the bucket for its tags.
    pub fn observe(&mut self, instance: &ServiceInstance) -> Status {
        let tags = TagSet::new(instance.tags.iter().cloned());
        let status = resolve_status(&instance.checks);
        self.buckets.entry(tags).or_default().increment(status);
        status
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn buckets(&self) -> &BTreeMap<TagSet, StatusCounts> {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of points [`ServiceAggregate::to_points`] will produce.
    pub fn point_count(&self) -> usize {
        self.buckets.len() * Status::ALL.len()
    }

    /// Produce one metric point per bucket and status.
    ///
    /// Tags are the bucket's tags followed by `status:`, `service:` and
    /// `datacenter:` tags.
    pub fn to_points(
        &self,
        datacenter: &str,
        timestamp: i64,
    ) -> impl Iterator<Item = MetricPoint> + '_ {
        let service_tag = format!("service:{}", self.service);
        let datacenter_tag = format!("datacenter:{}", datacenter);
        self.buckets.iter().flat_map(move |(tags, counts)| {
            let service_tag = service_tag.clone();
            let datacenter_tag = datacenter_tag.clone();
            Status::ALL.into_iter().map(move |status| {
                let mut point_tags = Vec::with_capacity(tags.len() + 3);
                point_tags.extend(tags.iter().map(String::from));
                point_tags.push(format!("status:{}", status));
                point_tags.push(service_tag.clone());
                point_tags.push(datacenter_tag.clone());
                MetricPoint::new(
                    METRIC_NAME,
                    timestamp,
                    counts.get(status) as f64,
                    point_tags,
                )
            })
        })
    }
}

/// Aggregate the instances of one service straight into metric points.
pub fn aggregate_service(
    service: &str,
    datacenter: &str,
    instances: &[ServiceInstance],
    timestamp: i64,
) -> Vec<MetricPoint> {
    ServiceAggregate::from_instances(service, instances)
        .to_points(datacenter, timestamp)
        .collect()
}
