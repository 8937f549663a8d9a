// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gate the poll loop behind a distributed lock.
//!
//! The [`LeaderGate`] acquires the lock, runs the [`Poller`] while it is held,
//! and tears the poller down when the lock is lost or a stop is requested.
//! After a loss it goes back to contending for the lock; after a stop it
//! returns. The poll task is always joined before the lock is released, so
//! no batch is submitted once the gate has begun giving up leadership.

use crate::lock::LeaderLock;
use crate::poller::Poller;
use crate::trigger::trigger;
use crate::trigger::Listener;
use crate::trigger::Trigger;
use crate::Error;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::time::Duration;
use tokio::task::JoinError;

/// How long a stopping poll loop may take to finish its cycle before it is
/// aborted.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the gate is in the lock lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaseState {
    Idle,
    Acquiring,
    Active,
    Releasing,
    Terminated,
}

// What woke the gate while it held the lock.
enum Wake {
    Stop,
    Lost,
    PollerFailed,
}

// Fires the wrapped trigger however `LeaderGate::run` exits.
struct FireOnDrop(Option<Trigger>);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        if let Some(trigger) = &self.0 {
            trigger.fire();
        }
    }
}

fn flatten(result: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
    result.map_err(Error::PollerTask).and_then(|r| r)
}

/// Runs a [`Poller`] only while holding a [`LeaderLock`].
pub struct LeaderGate {
    log: Logger,
    lock: Box<dyn LeaderLock>,
    poller: Poller,
    iteration_limit: usize,
    shutdown_timeout: Duration,
    state: LeaseState,
}

impl LeaderGate {
    pub fn new(
        log: &Logger,
        lock: Box<dyn LeaderLock>,
        poller: Poller,
    ) -> Self {
        let log = log.new(o!(
            "component" => "leader-gate",
            "lock_key" => lock.key().to_string(),
        ));
        Self {
            log,
            lock,
            poller,
            iteration_limit: 0,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: LeaseState::Idle,
        }
    }

    /// Bound the number of cycles each poll loop runs. Zero means unbounded.
    pub fn with_iteration_limit(mut self, iteration_limit: usize) -> Self {
        self.iteration_limit = iteration_limit;
        self
    }

    /// Bound how long the gate waits for a cancelled poll loop to finish.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    fn transition(&mut self, next: LeaseState) {
        debug!(
            self.log,
            "lease state transition";
            "from" => ?self.state,
            "to" => ?next,
        );
        self.state = next;
    }

    /// Contend for the lock and poll while holding it, until `stop` fires.
    ///
    /// Returns `Ok(())` after a requested stop, or the first fatal error from
    /// acquiring the lock or from the poll loop. The lock is not held when
    /// this returns, and `stopped`, if provided, has been fired.
    pub async fn run(
        mut self,
        mut stop: Listener,
        stopped: Option<Trigger>,
    ) -> Result<(), Error> {
        let _stopped = FireOnDrop(stopped);
        loop {
            self.transition(LeaseState::Acquiring);
            info!(self.log, "attempting to acquire lock");
            let mut lost = match self.lock.acquire(stop.clone()).await {
                Ok(Some(lost)) => lost,
                Ok(None) => {
                    info!(self.log, "stop requested while acquiring lock");
                    self.transition(LeaseState::Terminated);
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        self.log,
                        "failed to acquire lock";
                        "error" => %e,
                    );
                    self.transition(LeaseState::Terminated);
                    return Err(e.into());
                }
            };
            info!(self.log, "acquired lock");
            self.transition(LeaseState::Active);

            let (cancel, cancel_rx) = trigger();
            let mut task = tokio::spawn(
                self.poller.clone().run(cancel_rx, self.iteration_limit),
            );
            let mut poller_done = false;
            let mut failure = None;
            let wake = loop {
                tokio::select! {
                    biased;

                    _ = stop.fired() => break Wake::Stop,
                    _ = lost.fired() => break Wake::Lost,
                    result = &mut task, if !poller_done => {
                        poller_done = true;
                        match flatten(result) {
                            Ok(()) => {
                                debug!(self.log, "poll loop finished");
                            }
                            Err(e) => {
                                failure = Some(e);
                                break Wake::PollerFailed;
                            }
                        }
                    }
                }
            };

            self.transition(LeaseState::Releasing);
            cancel.fire();
            let outcome = match failure {
                Some(e) => Err(e),
                None if poller_done => Ok(()),
                None => match tokio::time::timeout(
                    self.shutdown_timeout,
                    &mut task,
                )
                .await
                {
                    Ok(result) => flatten(result),
                    Err(_) => {
                        warn!(
                            self.log,
                            "poll loop did not stop in time, aborting it";
                            "timeout" => ?self.shutdown_timeout,
                        );
                        task.abort();
                        let _ = task.await;
                        Ok(())
                    }
                },
            };

            match wake {
                Wake::Stop => {
                    info!(self.log, "stop requested, releasing lock");
                    if let Err(e) = self.lock.release().await {
                        warn!(
                            self.log,
                            "failed to release lock";
                            "error" => %e,
                        );
                    }
                    self.transition(LeaseState::Terminated);
                    return outcome;
                }
                Wake::Lost => {
                    warn!(self.log, "lock lost");
                    if let Err(e) = self.lock.release().await {
                        warn!(
                            self.log,
                            "failed to release lost lock";
                            "error" => %e,
                        );
                    }
                    if let Err(e) = self.lock.destroy().await {
                        warn!(
                            self.log,
                            "failed to destroy lost lock";
                            "error" => %e,
                        );
                    }
                    if outcome.is_err() {
                        self.transition(LeaseState::Terminated);
                        return outcome;
                    }
                    self.transition(LeaseState::Idle);
                }
                Wake::PollerFailed => {
                    error!(self.log, "poll loop failed, releasing lock");
                    if let Err(e) = self.lock.release().await {
                        warn!(
                            self.log,
                            "failed to release lock";
                            "error" => %e,
                        );
                    }
                    self.transition(LeaseState::Terminated);
                    return outcome;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LeaderGate;
    use super::LeaseState;
    use crate::fakes::test_logger;
    use crate::fakes::FakeDirectory;
    use crate::fakes::FakeLock;
    use crate::fakes::FakeLockHandle;
    use crate::fakes::RecordingSink;
    use crate::poller::Poller;
    use crate::trigger::trigger;
    use crate::Error;
    use census_types::HealthCheck;
    use census_types::ServiceInstance;
    use std::sync::Arc;
    use std::time::Duration;

    const INTERVAL: Duration = Duration::from_secs(10);

    struct Harness {
        gate: LeaderGate,
        lock: FakeLockHandle,
        directory: Arc<FakeDirectory>,
        sink: Arc<RecordingSink>,
    }

    fn harness(name: &str, sink: RecordingSink) -> Harness {
        let log = test_logger(name);
        let directory = Arc::new(FakeDirectory::new("dc1").with_service(
            "web",
            vec![ServiceInstance::new("web")
                .with_tags(["test"])
                .with_check(HealthCheck::new("passing"))],
        ));
        let sink = Arc::new(sink);
        let poller =
            Poller::new(&log, directory.clone(), sink.clone(), INTERVAL);
        let (lock, handle) = FakeLock::new("census/.lock");
        let gate = LeaderGate::new(&log, Box::new(lock), poller);
        Harness { gate, lock: handle, directory, sink }
    }

    #[test]
    fn test_new_gate_is_idle() {
        let h = harness("new_gate_is_idle", RecordingSink::new());
        assert_eq!(h.gate.state(), LeaseState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_shutdown_releases_once() {
        let h = harness("clean_shutdown", RecordingSink::new());
        let (stop, stop_rx) = trigger();
        let (stopped, mut stopped_rx) = trigger();
        let task = tokio::spawn(h.gate.run(stop_rx, Some(stopped.clone())));

        h.lock.wait_for_acquisitions(1).await;
        h.sink.wait_for_batches(2).await;
        assert!(h.lock.is_held());
        assert!(!stopped_rx.is_fired());

        stop.fire();
        task.await.unwrap().unwrap();
        stopped_rx.fired().await;
        assert!(stopped.is_fired());
        assert!(!h.lock.is_held());
        assert_eq!(h.lock.acquisitions(), 1);
        assert_eq!(h.lock.releases(), 1);
        assert_eq!(h.lock.destroys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_loss_reacquires() {
        let h = harness("lock_loss", RecordingSink::new());
        let (stop, stop_rx) = trigger();
        let task = tokio::spawn(h.gate.run(stop_rx, None));

        h.lock.wait_for_acquisitions(1).await;
        h.sink.wait_for_batches(1).await;
        h.lock.lose_lock();
        h.lock.wait_for_acquisitions(2).await;
        assert_eq!(h.lock.releases(), 1);
        assert_eq!(h.lock.destroys(), 1);
        assert!(!task.is_finished());

        // Polling resumes under the new lease.
        let before = h.sink.batches().len();
        h.sink.wait_for_batches(before + 1).await;

        stop.fire();
        task.await.unwrap().unwrap();
        assert_eq!(h.lock.acquisitions(), 2);
        assert_eq!(h.lock.releases(), 2);
        assert_eq!(h.lock.destroys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_once_lock_is_lost() {
        let h = harness("polling_stops_on_loss", RecordingSink::new());
        let (stop, stop_rx) = trigger();
        let task = tokio::spawn(h.gate.run(stop_rx, None));

        h.sink.wait_for_batches(1).await;
        // Nobody else will grant us the lock again.
        h.lock.set_contended(true);
        h.lock.lose_lock();
        while h.lock.releases() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let submitted = h.sink.batches().len();
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(h.sink.batches().len(), submitted);
        assert!(!h.lock.is_held());

        stop.fire();
        task.await.unwrap().unwrap();
        assert_eq!(h.lock.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_error_is_fatal() {
        let h = harness("acquire_error", RecordingSink::new());
        h.lock.set_fail_acquire(true);
        let (_stop, stop_rx) = trigger();
        let (stopped, stopped_rx) = trigger();
        let result = h.gate.run(stop_rx, Some(stopped)).await;
        assert!(matches!(result, Err(Error::Lock(_))));
        assert!(stopped_rx.is_fired());
        assert_eq!(h.lock.releases(), 0);
        assert_eq!(h.directory.calls().self_datacenter, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_acquiring() {
        let h = harness("stop_while_acquiring", RecordingSink::new());
        h.lock.set_contended(true);
        let (stop, stop_rx) = trigger();
        let task = tokio::spawn(h.gate.run(stop_rx, None));
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(!task.is_finished());

        stop.fire();
        task.await.unwrap().unwrap();
        assert_eq!(h.lock.acquisitions(), 0);
        assert_eq!(h.lock.releases(), 0);
        assert!(h.sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_failure_releases_and_propagates() {
        let h = harness("poller_failure", RecordingSink::failing());
        let (_stop, stop_rx) = trigger();
        let (stopped, stopped_rx) = trigger();
        let result = h.gate.run(stop_rx, Some(stopped)).await;
        assert!(matches!(result, Err(Error::Sink(_))));
        assert!(stopped_rx.is_fired());
        assert!(!h.lock.is_held());
        assert_eq!(h.lock.releases(), 1);
        assert_eq!(h.lock.destroys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_poll_cycle_does_not_block_stop() {
        let h = harness("stalled_poll_cycle", RecordingSink::new());
        h.directory.stall_list();
        let (stop, stop_rx) = trigger();
        let task = tokio::spawn(
            h.gate
                .with_shutdown_timeout(Duration::from_secs(5))
                .run(stop_rx, None),
        );

        h.lock.wait_for_acquisitions(1).await;
        // The first cycle starts after one interval and never completes.
        tokio::time::sleep(INTERVAL + Duration::from_secs(5)).await;
        assert_eq!(h.directory.calls().list_services, 1);

        stop.fire();
        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("gate should return after a stop")
            .unwrap()
            .unwrap();
        assert!(!h.lock.is_held());
        assert_eq!(h.lock.releases(), 1);
        assert!(h.sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_poller_keeps_lease_until_stop() {
        let h = harness("finished_poller", RecordingSink::new());
        let (stop, stop_rx) = trigger();
        let task =
            tokio::spawn(h.gate.with_iteration_limit(1).run(stop_rx, None));

        h.sink.wait_for_batches(1).await;
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(h.sink.batches().len(), 1);
        assert!(h.lock.is_held());
        assert!(!task.is_finished());

        stop.fire();
        task.await.unwrap().unwrap();
        assert_eq!(h.lock.releases(), 1);
    }
}
