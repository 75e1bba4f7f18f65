use std::future::Future;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;

/// Serializes and paces every upstream call the monitor fleet makes.
///
/// The fair async mutex admits callers one at a time in FIFO order, so at
/// most one adapter call is in flight across the whole process; the
/// governor limiter then enforces the minimum spacing between successive
/// dispatches. Errors from the scheduled future propagate to the caller
/// untouched.
pub struct RateLimitedScheduler {
    gate: Mutex<()>,
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitedScheduler {
    pub fn new(min_spacing: Duration) -> Self {
        let limiter = Quota::with_period(min_spacing)
            .map(|quota| RateLimiter::direct(quota.allow_burst(std::num::NonZeroU32::MIN)));
        Self {
            gate: Mutex::new(()),
            limiter,
        }
    }

    pub async fn schedule<F: Future>(&self, call: F) -> F::Output {
        let _slot = self.gate.lock().await;
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        call.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test]
    async fn one_call_in_flight_at_a_time() {
        let scheduler = Arc::new(RateLimitedScheduler::new(Duration::ZERO));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                scheduler
                    .schedule(async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatches_are_spaced() {
        let scheduler = RateLimitedScheduler::new(Duration::from_millis(20));
        let mut starts = Vec::new();
        for _ in 0..3 {
            scheduler.schedule(async { starts.push(Instant::now()) }).await;
        }
        // first dispatch is immediate, later ones at least a period apart
        assert!(starts[1] - starts[0] >= Duration::from_millis(15));
        assert!(starts[2] - starts[1] >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn caller_errors_propagate() {
        let scheduler = RateLimitedScheduler::new(Duration::ZERO);
        let result: Result<(), &str> = scheduler.schedule(async { Err("rpc down") }).await;
        assert_eq!(result, Err("rpc down"));
    }
}
