// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The service directory consulted on every poll.

use async_trait::async_trait;
use census_types::ServiceInstance;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors querying a [`Directory`].
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to send request to the directory")]
    Request(#[from] reqwest::Error),

    #[error("directory responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("directory did not report a datacenter")]
    MissingDatacenter,

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// A source of service names and per-instance health.
#[async_trait]
pub trait Directory: Send + Sync {
    /// List every known service name.
    ///
    /// Values are the tags the directory associates with each service; they
    /// are not used for aggregation.
    async fn list_services(
        &self,
    ) -> Result<BTreeMap<String, Vec<String>>, DirectoryError>;

    /// Fetch every instance of `service` along with its health checks.
    ///
    /// `tag` restricts the result to instances carrying that tag, and
    /// `passing_only` to instances whose checks all pass.
    async fn service_health(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceInstance>, DirectoryError>;

    /// Return the datacenter of the agent we're talking to.
    async fn self_datacenter(&self) -> Result<String, DirectoryError>;
}
