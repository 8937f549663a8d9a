// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Distributed mutual exclusion used to elect a single active poller.

use crate::trigger::Listener;
use async_trait::async_trait;
use thiserror::Error;

/// Errors operating a [`LeaderLock`].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to send request to the lock service")]
    Request(#[from] reqwest::Error),

    #[error("lock service responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("lock is already held by this process")]
    AlreadyHeld,

    #[error("lock is not held")]
    NotHeld,

    #[error("lock is held and cannot be destroyed")]
    Held,

    #[error("lock key exists but is not used as a lock")]
    Conflict,

    #[error("lock is in use by another holder")]
    InUse,

    #[error("lock unavailable: {0}")]
    Unavailable(String),
}

/// A handle on a distributed lock.
///
/// Implementations need not make `release` or `destroy` idempotent; callers
/// should call each at most once per acquisition.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// The key or path identifying the lock, for logging.
    fn key(&self) -> &str;

    /// Block until the lock is acquired, or until `stop` fires.
    ///
    /// On success returns a listener that fires if the lock is later lost.
    /// Returns `Ok(None)` if `stop` fired before the lock was granted.
    async fn acquire(
        &mut self,
        stop: Listener,
    ) -> Result<Option<Listener>, LockError>;

    /// Release a held lock.
    async fn release(&mut self) -> Result<(), LockError>;

    /// Remove the lock's backing state, if nobody holds it.
    async fn destroy(&mut self) -> Result<(), LockError>;
}
