// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Consul-backed [`Directory`] and [`LeaderLock`].
//!
//! The lock is a session-based KV lock, compatible with the one implemented
//! by Consul's own API client: a session with a TTL is created and kept
//! alive in the background, and the lock is the key acquired by that
//! session with a well-known flag value. Other clients of the same
//! convention (e.g. `consul lock`) therefore contend for the same key.

use crate::directory::Directory;
use crate::directory::DirectoryError;
use crate::lock::LeaderLock;
use crate::lock::LockError;
use crate::trigger::trigger;
use crate::trigger::Listener;
use crate::trigger::Trigger;
use async_trait::async_trait;
use census_types::HealthCheck;
use census_types::ServiceInstance;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Name given to lock sessions.
pub const LOCK_SESSION_NAME: &str = "Consul API Lock";
/// TTL of lock sessions. They are renewed every half TTL.
pub const LOCK_SESSION_TTL: Duration = Duration::from_secs(15);
/// Maximum time a blocking query waits for the lock key to change.
pub const LOCK_WAIT_TIME: Duration = Duration::from_secs(15);
/// Delay before retrying after the lock service refused an acquisition.
pub const LOCK_RETRY_TIME: Duration = Duration::from_secs(5);
/// Flag value marking a key as a lock.
pub const LOCK_FLAG_VALUE: u64 = 0x2ddccbc058a50c18;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
// Must outlast a blocking query, which Consul may hold for up to the wait
// time plus wait/16 of jitter.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

fn default_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

/// How to reach a Consul agent.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    /// Base address of the agent's HTTP API. A missing scheme means `http`.
    #[serde(default = "default_address")]
    pub address: String,
    /// ACL token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    /// Datacenter to query, if not the agent's own.
    #[serde(default)]
    pub datacenter: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self { address: default_address(), token: None, datacenter: None }
    }
}

// A response whose status we didn't expect.
struct UnexpectedStatus {
    status: u16,
    body: String,
}

impl UnexpectedStatus {
    async fn read(response: Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self { status, body }
    }
}

impl From<UnexpectedStatus> for DirectoryError {
    fn from(e: UnexpectedStatus) -> Self {
        DirectoryError::Status { status: e.status, body: e.body }
    }
}

impl From<UnexpectedStatus> for LockError {
    fn from(e: UnexpectedStatus) -> Self {
        LockError::Status { status: e.status, body: e.body }
    }
}

async fn check_status(
    response: Response,
) -> Result<Response, UnexpectedStatus> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(UnexpectedStatus::read(response).await)
    }
}

fn consul_index(response: &Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    flags: u64,
    #[serde(default)]
    session: Option<String>,
    modify_index: u64,
}

impl KvPair {
    fn holder(&self) -> Option<&str> {
        self.session.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthEntryCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    node: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntryCheck {
    #[serde(default)]
    name: String,
    status: String,
}

impl From<HealthEntry> for ServiceInstance {
    fn from(entry: HealthEntry) -> Self {
        ServiceInstance {
            service_name: entry.service.service,
            node: entry.node.node,
            tags: entry.service.tags.unwrap_or_default(),
            checks: entry
                .checks
                .into_iter()
                .map(|check| HealthCheck::named(check.name, check.status))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentSelf {
    #[serde(rename = "Config")]
    config: Option<AgentConfig>,
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
    #[serde(rename = "Datacenter")]
    datacenter: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: Uuid,
}

/// A thin client for the parts of the Consul HTTP API we use.
#[derive(Clone, Debug)]
pub struct ConsulClient {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self, reqwest::Error> {
        let address = config.address.trim_end_matches('/');
        let address = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            address,
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder =
            self.http.request(method, format!("{}{}", self.address, path));
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder
    }

    // Requests against catalog, health and KV state are scoped to the
    // configured datacenter.
    fn request_in_dc(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.request(method, path);
        match &self.datacenter {
            Some(dc) => builder.query(&[("dc", dc)]),
            None => builder,
        }
    }

    async fn kv_get(
        &self,
        key: &str,
        index: u64,
        wait: Option<Duration>,
    ) -> Result<(Option<KvPair>, u64), LockError> {
        let mut builder =
            self.request_in_dc(Method::GET, &format!("/v1/kv/{}", key));
        if let Some(wait) = wait {
            builder = builder.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", wait.as_secs())),
            ]);
        }
        let response = builder.send().await?;
        let index = consul_index(&response);
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((None, index));
        }
        let pairs: Vec<KvPair> = check_status(response).await?.json().await?;
        Ok((pairs.into_iter().next(), index))
    }

    async fn kv_put_lock(
        &self,
        key: &str,
        operation: &str,
        session: Uuid,
    ) -> Result<bool, LockError> {
        let response = self
            .request_in_dc(Method::PUT, &format!("/v1/kv/{}", key))
            .query(&[
                (operation, session.to_string()),
                ("flags", LOCK_FLAG_VALUE.to_string()),
            ])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn kv_delete_cas(
        &self,
        key: &str,
        modify_index: u64,
    ) -> Result<bool, LockError> {
        let response = self
            .request_in_dc(Method::DELETE, &format!("/v1/kv/{}", key))
            .query(&[("cas", modify_index.to_string())])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn create_session(&self) -> Result<Uuid, LockError> {
        let body = SessionRequest {
            name: LOCK_SESSION_NAME,
            ttl: format!("{}s", LOCK_SESSION_TTL.as_secs()),
        };
        let response = self
            .request_in_dc(Method::PUT, "/v1/session/create")
            .json(&body)
            .send()
            .await?;
        let created: SessionCreated =
            check_status(response).await?.json().await?;
        Ok(created.id)
    }

    /// Returns `false` if the session no longer exists.
    async fn renew_session(&self, session: Uuid) -> Result<bool, LockError> {
        let response = self
            .request_in_dc(
                Method::PUT,
                &format!("/v1/session/renew/{}", session),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }

    async fn destroy_session(&self, session: Uuid) -> Result<(), LockError> {
        let response = self
            .request_in_dc(
                Method::PUT,
                &format!("/v1/session/destroy/{}", session),
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// The Consul catalog and health endpoints, as a [`Directory`].
#[derive(Clone, Debug)]
pub struct ConsulDirectory {
    client: ConsulClient,
}

impl ConsulDirectory {
    pub fn new(client: ConsulClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Directory for ConsulDirectory {
    async fn list_services(
        &self,
    ) -> Result<BTreeMap<String, Vec<String>>, DirectoryError> {
        let response = self
            .client
            .request_in_dc(Method::GET, "/v1/catalog/services")
            .send()
            .await?;
        let services: BTreeMap<String, Option<Vec<String>>> =
            check_status(response).await?.json().await?;
        Ok(services
            .into_iter()
            .map(|(name, tags)| (name, tags.unwrap_or_default()))
            .collect())
    }

    async fn service_health(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
    ) -> Result<Vec<ServiceInstance>, DirectoryError> {
        let mut builder = self.client.request_in_dc(
            Method::GET,
            &format!("/v1/health/service/{}", service),
        );
        if let Some(tag) = tag {
            builder = builder.query(&[("tag", tag)]);
        }
        if passing_only {
            builder = builder.query(&[("passing", "1")]);
        }
        let response = builder.send().await?;
        let entries: Vec<HealthEntry> =
            check_status(response).await?.json().await?;
        Ok(entries.into_iter().map(ServiceInstance::from).collect())
    }

    async fn self_datacenter(&self) -> Result<String, DirectoryError> {
        let response =
            self.client.request(Method::GET, "/v1/agent/self").send().await?;
        let agent: AgentSelf = check_status(response).await?.json().await?;
        agent
            .config
            .and_then(|config| config.datacenter)
            .ok_or(DirectoryError::MissingDatacenter)
    }
}

// Background tasks that exist while the lock is held.
struct HeldLock {
    session: Uuid,
    renew: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.renew.abort();
        self.monitor.abort();
    }
}

enum Attempt {
    Acquired { index: u64 },
    HeldElsewhere { index: u64 },
    Refused,
}

/// A session-based lock on a Consul KV key.
pub struct ConsulLock {
    log: Logger,
    client: ConsulClient,
    key: String,
    held: Option<HeldLock>,
}

impl ConsulLock {
    pub fn new(log: &Logger, client: ConsulClient, key: &str) -> Self {
        let key = key.trim_start_matches('/').to_string();
        let log =
            log.new(o!("component" => "consul-lock", "key" => key.clone()));
        Self { log, client, key, held: None }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    async fn attempt(
        &self,
        session: Uuid,
        index: u64,
    ) -> Result<Attempt, LockError> {
        let (pair, index) =
            self.client.kv_get(&self.key, index, Some(LOCK_WAIT_TIME)).await?;
        if let Some(pair) = &pair {
            if pair.flags != LOCK_FLAG_VALUE {
                return Err(LockError::Conflict);
            }
            let session_id = session.to_string();
            match pair.holder() {
                Some(holder) if holder == session_id => {
                    return Ok(Attempt::Acquired { index });
                }
                Some(holder) => {
                    debug!(self.log, "lock is held"; "holder" => holder);
                    return Ok(Attempt::HeldElsewhere { index });
                }
                None => (),
            }
        }
        if self.client.kv_put_lock(&self.key, "acquire", session).await? {
            Ok(Attempt::Acquired { index })
        } else {
            Ok(Attempt::Refused)
        }
    }

    async fn abandon_session(&self, session: Uuid) {
        if let Err(e) = self.client.destroy_session(session).await {
            warn!(
                self.log,
                "failed to destroy lock session";
                "session" => %session,
                "error" => %e,
            );
        }
    }
}

#[async_trait]
impl LeaderLock for ConsulLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn acquire(
        &mut self,
        mut stop: Listener,
    ) -> Result<Option<Listener>, LockError> {
        if self.held.is_some() {
            return Err(LockError::AlreadyHeld);
        }
        let session = self.client.create_session().await?;
        debug!(self.log, "created lock session"; "session" => %session);
        let (lost, lost_rx) = trigger();
        let renew = tokio::spawn(renew_session(
            self.log.clone(),
            self.client.clone(),
            session,
            lost.clone(),
        ));

        let mut index = 0;
        let acquired_index = loop {
            let attempt = tokio::select! {
                biased;

                _ = stop.fired() => None,
                attempt = self.attempt(session, index) => Some(attempt),
            };
            match attempt {
                None => {
                    debug!(self.log, "stop requested while waiting for lock");
                    renew.abort();
                    self.abandon_session(session).await;
                    return Ok(None);
                }
                Some(Ok(Attempt::Acquired { index })) => break index,
                Some(Ok(Attempt::HeldElsewhere { index: next })) => {
                    index = if next < index { 0 } else { next };
                }
                Some(Ok(Attempt::Refused)) => {
                    // Most likely the key is in its lock-delay period.
                    index = 0;
                    tokio::select! {
                        biased;

                        _ = stop.fired() => {}
                        _ = tokio::time::sleep(LOCK_RETRY_TIME) => {}
                    }
                }
                Some(Err(e)) => {
                    renew.abort();
                    self.abandon_session(session).await;
                    return Err(e);
                }
            }
        };

        info!(self.log, "acquired lock"; "session" => %session);
        let monitor = tokio::spawn(monitor_lock(
            self.log.clone(),
            self.client.clone(),
            self.key.clone(),
            session,
            acquired_index,
            lost,
        ));
        self.held = Some(HeldLock { session, renew, monitor });
        Ok(Some(lost_rx))
    }

    async fn release(&mut self) -> Result<(), LockError> {
        let held = self.held.take().ok_or(LockError::NotHeld)?;
        let session = held.session;
        drop(held);

        // Destroy the session even if releasing the key failed.
        let released =
            self.client.kv_put_lock(&self.key, "release", session).await;
        let destroyed = self.client.destroy_session(session).await;
        if let Ok(false) = released {
            warn!(
                self.log,
                "lock key was not held by our session";
                "session" => %session,
            );
        }
        released?;
        destroyed?;
        info!(self.log, "released lock"; "session" => %session);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), LockError> {
        if self.held.is_some() {
            return Err(LockError::Held);
        }
        let (pair, _) = self.client.kv_get(&self.key, 0, None).await?;
        let Some(pair) = pair else {
            return Ok(());
        };
        if pair.flags != LOCK_FLAG_VALUE {
            return Err(LockError::Conflict);
        }
        if pair.holder().is_some() {
            return Err(LockError::InUse);
        }
        if !self.client.kv_delete_cas(&self.key, pair.modify_index).await? {
            return Err(LockError::InUse);
        }
        debug!(self.log, "destroyed lock key");
        Ok(())
    }
}

async fn renew_session(
    log: Logger,
    client: ConsulClient,
    session: Uuid,
    lost: Trigger,
) {
    let mut timer = tokio::time::interval(LOCK_SESSION_TTL / 2);
    timer.tick().await; // completes immediately
    let mut last_renewed = Instant::now();
    loop {
        timer.tick().await;
        match client.renew_session(session).await {
            Ok(true) => last_renewed = Instant::now(),
            Ok(false) => {
                warn!(log, "lock session expired"; "session" => %session);
                lost.fire();
                return;
            }
            Err(e) => {
                warn!(
                    log,
                    "failed to renew lock session";
                    "session" => %session,
                    "error" => %e,
                );
                if last_renewed.elapsed() >= LOCK_SESSION_TTL {
                    lost.fire();
                    return;
                }
            }
        }
    }
}

async fn monitor_lock(
    log: Logger,
    client: ConsulClient,
    key: String,
    session: Uuid,
    mut index: u64,
    lost: Trigger,
) {
    let session_id = session.to_string();
    loop {
        match client.kv_get(&key, index, Some(LOCK_WAIT_TIME)).await {
            Ok((Some(pair), next))
                if pair.holder() == Some(session_id.as_str()) =>
            {
                index = if next < index { 0 } else { next };
            }
            Ok((pair, _)) => {
                warn!(
                    log,
                    "lock is no longer held by this session";
                    "session" => %session,
                    "holder" => pair.as_ref().and_then(|p| p.holder()),
                );
                lost.fire();
                return;
            }
            Err(e) => {
                warn!(log, "failed to watch lock"; "error" => %e);
                lost.fire();
                return;
            }
        }
    }
}
