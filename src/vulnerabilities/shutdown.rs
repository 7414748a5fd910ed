//! External shutdown signalling.
//!
//! The same signal is awaited from blocking code (the rate limiter) and from
//! async code (a pending HTTP request), hence the condition variable next to
//! the watch channel.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

struct Inner {
    triggered: Mutex<bool>,
    condvar: Condvar,
    sender: watch::Sender<bool>,
}

/// A cloneable, one-shot shutdown flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                triggered: Mutex::new(false),
                condvar: Condvar::new(),
                sender,
            }),
        }
    }

    /// Fires the signal and wakes every waiter.
    pub fn trigger(&self) {
        debug!("Shutdown requested");
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.condvar.notify_all();
        self.inner.sender.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Blocks for at most `timeout`, returning early if the signal fires.
    /// Returns whether the signal has fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        trace!("Waiting up to {:?} on the shutdown signal", timeout);
        let mut triggered = self.inner.triggered.lock();
        if !*triggered {
            self.inner.condvar.wait_for(&mut triggered, timeout);
        }
        *triggered
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.sender.subscribe();
        // The sender lives as long as `self`, the wait cannot fail.
        let _ = receiver.wait_for(|fired| *fired).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
