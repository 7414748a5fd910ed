//! Throttling of the outbound calls.
//!
//! The NVD allows 5 requests in a rolling 30 seconds window without an API
//! key, 50 with one. The [`RateLimiter`] records when each granted permit
//! expires and makes callers wait for the oldest one once the window is full.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;

use crate::errors::FetchError;
use crate::vulnerabilities::shutdown::ShutdownSignal;

/// Grants at most `quantity` permits within any trailing `duration`.
///
/// Safe to share between threads; the bound is global to the instance.
pub struct RateLimiter {
    quantity: usize,
    duration: Duration,
    /// Expiry instants of the outstanding permits, oldest first.
    permits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter. A zero quantity is raised to one.
    pub fn new(quantity: usize, duration: Duration) -> Self {
        let quantity = quantity.max(1);
        Self {
            quantity,
            duration,
            permits: Mutex::new(VecDeque::with_capacity(quantity)),
        }
    }

    /// The limiter the NVD expects for unauthenticated or keyed callers.
    pub fn for_nvd(has_api_key: bool) -> Self {
        let quantity = if has_api_key { 50 } else { 5 };
        Self::new(quantity, Duration::from_secs(30))
    }

    /// The limiter used for the GitHub GraphQL API, well under its hourly
    /// point budget.
    pub fn for_github() -> Self {
        Self::new(30, Duration::from_secs(60))
    }

    /// Blocks until a permit is available, then records it.
    ///
    /// Fails with [`FetchError::Interrupted`] if `shutdown` fires while
    /// waiting; no permit is recorded in that case.
    pub fn acquire(&self, shutdown: &ShutdownSignal) -> Result<(), FetchError> {
        loop {
            if shutdown.is_triggered() {
                return Err(FetchError::Interrupted);
            }
            let wait = {
                let mut permits = self.permits.lock();
                let now = Instant::now();
                while permits.front().is_some_and(|expiry| *expiry <= now) {
                    permits.pop_front();
                }
                if permits.len() < self.quantity {
                    permits.push_back(now + self.duration);
                    return Ok(());
                }
                match permits.front() {
                    Some(oldest) => oldest.saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            trace!("Rate limit reached, waiting {:?}", wait);
            if shutdown.wait_timeout(wait) {
                return Err(FetchError::Interrupted);
            }
        }
    }

    /// The number of permits granted within the current window.
    pub fn outstanding(&self) -> usize {
        let now = Instant::now();
        self.permits
            .lock()
            .iter()
            .filter(|expiry| **expiry > now)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permits_within_quantity_are_immediate() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        let shutdown = ShutdownSignal::new();
        let start = Instant::now();
        limiter.acquire(&shutdown).unwrap();
        limiter.acquire(&shutdown).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn permit_beyond_quantity_waits_for_the_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100));
        let shutdown = ShutdownSignal::new();
        let start = Instant::now();
        limiter.acquire(&shutdown).unwrap();
        limiter.acquire(&shutdown).unwrap();
        limiter.acquire(&shutdown).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn interrupted_wait_records_nothing() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(10)));
        let shutdown = ShutdownSignal::new();
        limiter.acquire(&shutdown).unwrap();

        let remote_limiter = Arc::clone(&limiter);
        let remote_shutdown = shutdown.clone();
        let handle = thread::spawn(move || remote_limiter.acquire(&remote_shutdown));
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        shutdown.trigger();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(FetchError::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(1, limiter.outstanding());
    }

    #[test]
    fn bound_is_shared_between_threads() {
        let limiter = Arc::new(RateLimiter::new(3, Duration::from_millis(150)));
        let shutdown = ShutdownSignal::new();
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let shutdown = shutdown.clone();
                thread::spawn(move || limiter.acquire(&shutdown))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        // Four permits with a quantity of three: one caller waited a window.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
