// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destinations for batches of metric points.

use async_trait::async_trait;
use census_types::MetricPoint;
use thiserror::Error;

/// Errors submitting metrics to a [`MetricsSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to send request to the metrics sink")]
    Request(#[from] reqwest::Error),

    #[error("metrics sink responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("the metrics sink rejected the API key")]
    InvalidApiKey,

    #[error("metrics sink unavailable: {0}")]
    Unavailable(String),
}

/// Something that accepts batches of metric points.
///
/// Whether a batch is applied atomically is up to the implementation.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn submit(&self, batch: &[MetricPoint]) -> Result<(), SinkError>;
}
