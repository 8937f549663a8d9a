// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Service instances and the health checks reported against them.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// The health classification of a service instance.
///
/// Variants are declared from worst to best, so the derived ordering sorts
/// `Critical` first.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Critical,
    Warning,
    Passing,
}

impl Status {
    /// Every status, in order of precedence.
    pub const ALL: [Status; 3] =
        [Status::Critical, Status::Warning, Status::Passing];

    /// Parse a status string as reported by a health check.
    ///
    /// Returns `None` for anything other than the three known statuses.
    pub fn from_check_status(s: &str) -> Option<Status> {
        match s {
            "critical" => Some(Status::Critical),
            "warning" => Some(Status::Warning),
            "passing" => Some(Status::Passing),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Critical => "critical",
            Status::Warning => "warning",
            Status::Passing => "passing",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitored aspect of a service instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HealthCheck {
    /// Human-readable name of the check, if the directory provides one.
    #[serde(default)]
    pub name: String,
    /// The raw status string.
    ///
    /// This is kept as reported, rather than as a [`Status`], because
    /// directories may report values outside the three we classify.
    pub status: String,
}

impl HealthCheck {
    pub fn new(status: impl Into<String>) -> Self {
        Self { name: String::new(), status: status.into() }
    }

    pub fn named(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self { name: name.into(), status: status.into() }
    }

    /// The classified status of this check, if it is one we recognize.
    pub fn status(&self) -> Option<Status> {
        Status::from_check_status(&self.status)
    }
}

/// One running occurrence of a named service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub service_name: String,
    /// The node the instance runs on, if known.
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl ServiceInstance {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), ..Default::default() }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.checks.push(check);
        self
    }
}
