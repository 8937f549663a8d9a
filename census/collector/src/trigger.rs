// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot, broadcast notifications.
//!
//! A [`Trigger`] is fired at most once; any number of [`Listener`]s observe
//! it. Firing is idempotent. A listener also resolves once every clone of its
//! trigger has been dropped, so a task that holds a trigger notifies its
//! listeners on any exit path, including a panic.
//!
//! These are used for requests to stop, for lock-lost notifications, and for
//! cancelling the poll loop.

use std::sync::Arc;
use tokio::sync::watch;

/// Create a linked trigger and listener.
pub fn trigger() -> (Trigger, Listener) {
    let (tx, rx) = watch::channel(false);
    (Trigger { tx: Arc::new(tx) }, Listener { rx })
}

/// The sending half of a one-shot notification.
#[derive(Clone, Debug)]
pub struct Trigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Trigger {
    /// Fire the trigger, waking all listeners.
    ///
    /// Returns `true` if this call was the one that fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create a new listener for this trigger.
    pub fn subscribe(&self) -> Listener {
        Listener { rx: self.tx.subscribe() }
    }
}

/// The receiving half of a one-shot notification.
#[derive(Clone, Debug)]
pub struct Listener {
    rx: watch::Receiver<bool>,
}

impl Listener {
    /// Wait until the trigger fires, or every trigger is dropped.
    pub async fn fired(&mut self) {
        // An error means all senders are gone, which we treat as firing.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    /// Return true if the trigger has fired or been dropped.
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}
