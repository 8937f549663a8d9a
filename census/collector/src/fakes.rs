// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for exercising the poller and leader gate.

use crate::directory::Directory;
use crate::directory::DirectoryError;
use crate::lock::LeaderLock;
use crate::lock::LockError;
use crate::sink::MetricsSink;
use crate::sink::SinkError;
use crate::trigger::trigger;
use crate::trigger::Listener;
use crate::trigger::Trigger;
use async_trait::async_trait;
use census_types::MetricPoint;
use census_types::ServiceInstance;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::watch;

/// Build a logger whose output is captured by the test harness.
pub fn test_logger(test_name: &str) -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("test" => test_name.to_string()))
}

/// How often each [`Directory`] operation has been called.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DirectoryCalls {
    pub list_services: usize,
    pub service_health: usize,
    pub self_datacenter: usize,
}

#[derive(Default)]
struct FakeDirectoryState {
    services: BTreeMap<String, Vec<ServiceInstance>>,
    failing_services: BTreeSet<String>,
    fail_list: bool,
    stall_list: bool,
    calls: DirectoryCalls,
}

/// A directory serving a fixed set of services.
pub struct FakeDirectory {
    datacenter: Option<String>,
    state: Mutex<FakeDirectoryState>,
}

impl FakeDirectory {
    pub fn new(datacenter: &str) -> Self {
        Self {
            datacenter: Some(datacenter.to_string()),
            state: Mutex::new(FakeDirectoryState::default()),
        }
    }

    /// A directory that cannot report its datacenter.
    pub fn without_datacenter() -> Self {
        Self { datacenter: None, state: Mutex::new(Default::default()) }
    }

    pub fn with_service(
        self,
        name: &str,
        instances: Vec<ServiceInstance>,
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .services
            .insert(name.to_string(), instances);
        self
    }

    /// Make health queries for `name` fail.
    pub fn fail_health(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.services.entry(name.to_string()).or_default();
        state.failing_services.insert(name.to_string());
    }

    pub fn fail_list(&self) {
        self.state.lock().unwrap().fail_list = true;
    }

    /// Make listing services hang forever.
    pub fn stall_list(&self) {
        self.state.lock().unwrap().stall_list = true;
    }

    pub fn calls(&self) -> DirectoryCalls {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn list_services(
        &self,
    ) -> Result<BTreeMap<String, Vec<String>>, DirectoryError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.list_services += 1;
            if state.fail_list {
                return Err(DirectoryError::Unavailable(
                    "catalog is down".into(),
                ));
            }
            if !state.stall_list {
                return Ok(state
                    .services
                    .keys()
                    .map(|name| (name.clone(), vec![]))
                    .collect());
            }
        }
        std::future::pending().await
    }

    async fn service_health(
        &self,
        service: &str,
        _tag: Option<&str>,
        _passing_only: bool,
    ) -> Result<Vec<ServiceInstance>, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        state.calls.service_health += 1;
        if state.failing_services.contains(service) {
            return Err(DirectoryError::Unavailable(format!(
                "health of {} is unavailable",
                service
            )));
        }
        state.services.get(service).cloned().ok_or_else(|| {
            DirectoryError::Unavailable(format!("unknown service {}", service))
        })
    }

    async fn self_datacenter(&self) -> Result<String, DirectoryError> {
        self.state.lock().unwrap().calls.self_datacenter += 1;
        self.datacenter.clone().ok_or(DirectoryError::MissingDatacenter)
    }
}

/// A sink that records every batch it is given.
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<MetricPoint>>>,
    submitted: watch::Sender<usize>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            submitted: watch::Sender::new(0),
            fail: false,
        }
    }

    /// A sink that rejects every batch.
    pub fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }

    pub fn batches(&self) -> Vec<Vec<MetricPoint>> {
        self.batches.lock().unwrap().clone()
    }

    /// Wait until at least `count` batches have been submitted.
    pub async fn wait_for_batches(&self, count: usize) {
        let mut rx = self.submitted.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn submit(&self, batch: &[MetricPoint]) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Status {
                status: 500,
                body: String::from("internal error"),
            });
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        self.submitted.send_modify(|n| *n += 1);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeLockState {
    held: bool,
    lost: Option<Trigger>,
    acquisitions: usize,
    releases: usize,
    destroys: usize,
    contended: bool,
    fail_acquire: bool,
}

/// A lock living entirely in memory.
///
/// A [`FakeLockHandle`] observes and perturbs it after it has been handed to
/// the code under test.
pub struct FakeLock {
    key: String,
    state: Arc<Mutex<FakeLockState>>,
    acquired: Arc<watch::Sender<usize>>,
}

#[derive(Clone)]
pub struct FakeLockHandle {
    state: Arc<Mutex<FakeLockState>>,
    acquired: Arc<watch::Sender<usize>>,
}

impl FakeLock {
    pub fn new(key: &str) -> (FakeLock, FakeLockHandle) {
        let state = Arc::new(Mutex::new(FakeLockState::default()));
        let acquired = Arc::new(watch::Sender::new(0));
        let handle = FakeLockHandle {
            state: Arc::clone(&state),
            acquired: Arc::clone(&acquired),
        };
        (FakeLock { key: key.to_string(), state, acquired }, handle)
    }
}

impl FakeLockHandle {
    /// Make the current holder lose the lock.
    pub fn lose_lock(&self) {
        if let Some(lost) = &self.state.lock().unwrap().lost {
            lost.fire();
        }
    }

    /// Make `acquire` block until it is told to stop.
    pub fn set_contended(&self, contended: bool) {
        self.state.lock().unwrap().contended = contended;
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.state.lock().unwrap().fail_acquire = fail;
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().held
    }

    pub fn acquisitions(&self) -> usize {
        self.state.lock().unwrap().acquisitions
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    pub fn destroys(&self) -> usize {
        self.state.lock().unwrap().destroys
    }

    /// Wait until the lock has been acquired at least `count` times.
    pub async fn wait_for_acquisitions(&self, count: usize) {
        let mut rx = self.acquired.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl LeaderLock for FakeLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn acquire(
        &mut self,
        mut stop: Listener,
    ) -> Result<Option<Listener>, LockError> {
        let contended = {
            let state = self.state.lock().unwrap();
            if state.fail_acquire {
                return Err(LockError::Unavailable("lock service down".into()));
            }
            if state.held {
                return Err(LockError::AlreadyHeld);
            }
            state.contended
        };
        if contended {
            stop.fired().await;
            return Ok(None);
        }
        if stop.is_fired() {
            return Ok(None);
        }

        let (lost_tx, lost_rx) = trigger();
        let mut state = self.state.lock().unwrap();
        state.held = true;
        state.acquisitions += 1;
        state.lost = Some(lost_tx);
        self.acquired.send_replace(state.acquisitions);
        Ok(Some(lost_rx))
    }

    async fn release(&mut self) -> Result<(), LockError> {
        let mut state = self.state.lock().unwrap();
        if !state.held {
            return Err(LockError::NotHeld);
        }
        state.held = false;
        state.releases += 1;
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), LockError> {
        let mut state = self.state.lock().unwrap();
        if state.held {
            return Err(LockError::Held);
        }
        state.destroys += 1;
        Ok(())
    }
}
