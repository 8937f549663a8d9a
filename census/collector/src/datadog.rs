// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Submit metric batches to the Datadog series API.

use crate::sink::MetricsSink;
use crate::sink::SinkError;
use async_trait::async_trait;
use census_types::MetricPoint;
use reqwest::Response;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

const API_KEY_HEADER: &str = "DD-API-KEY";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn default_api_url() -> String {
    "https://api.datadoghq.com".to_string()
}

/// How to reach Datadog.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatadogConfig {
    /// Base URL of the API, which varies by Datadog site.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for DatadogConfig {
    fn default() -> Self {
        Self { api_url: default_api_url(), api_key: None }
    }
}

#[derive(Debug, Serialize)]
struct Series<'a> {
    series: Vec<Metric<'a>>,
}

#[derive(Debug, Serialize)]
struct Metric<'a> {
    metric: &'a str,
    points: [(i64, f64); 1],
    tags: &'a [String],
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> From<&'a MetricPoint> for Metric<'a> {
    fn from(point: &'a MetricPoint) -> Self {
        Metric {
            metric: &point.name,
            points: [(point.timestamp, point.value)],
            tags: &point.tags,
            kind: "gauge",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Validation {
    #[serde(default)]
    valid: bool,
}

/// A [`MetricsSink`] posting gauges to Datadog.
#[derive(Clone, Debug)]
pub struct DatadogClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl DatadogClient {
    pub fn new(
        api_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Check the API key with Datadog.
    pub async fn validate(&self) -> Result<(), SinkError> {
        let response = self
            .http
            .get(format!("{}/api/v1/validate", self.api_url))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(SinkError::InvalidApiKey);
        }
        let validation: Validation =
            check_status(response).await?.json().await?;
        if validation.valid {
            Ok(())
        } else {
            Err(SinkError::InvalidApiKey)
        }
    }
}

async fn check_status(response: Response) -> Result<Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Status { status: status.as_u16(), body })
}

#[async_trait]
impl MetricsSink for DatadogClient {
    async fn submit(&self, batch: &[MetricPoint]) -> Result<(), SinkError> {
        let body = Series { series: batch.iter().map(Metric::from).collect() };
        let response = self
            .http
            .post(format!("{}/api/v1/series", self.api_url))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
