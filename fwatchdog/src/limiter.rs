//! Optimistic in-flight request limiter.
//!
//! Two monotonically increasing counters track started and completed
//! requests. A request is admitted while `started - completed` stays within
//! the cap; only the difference is ever compared, so wrap-around is harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Counts in-flight requests against a fixed cap.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    /// Requests admitted or rejected so far.
    started: AtomicU64,
    /// Requests finished or rejected so far.
    completed: AtomicU64,
    /// Cap on `started - completed`.
    max_inflight: u64,
}

/// An admitted request. Dropping it marks the request completed, including
/// when the handler future is cancelled.
#[derive(Debug)]
pub struct Permit {
    /// Limiter to credit on drop.
    limiter: Arc<ConcurrencyLimiter>,
}

/// Request extension holding the admitted request's [`Permit`].
///
/// A handler whose work outlives the request takes the permit and moves it
/// into that work; otherwise it is released when the middleware returns.
#[derive(Debug, Clone)]
pub struct HeldPermit(Arc<Mutex<Option<Permit>>>);

impl HeldPermit {
    /// Wraps an admitted permit.
    fn new(permit: Permit) -> Self {
        Self(Arc::new(Mutex::new(Some(permit))))
    }

    /// Takes the permit; `None` if another holder already took it.
    pub fn take(&self) -> Option<Permit> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter, or `None` when `max_inflight` is zero (no limit).
    pub fn new(max_inflight: u64) -> Option<Arc<Self>> {
        (max_inflight > 0).then(|| {
            Arc::new(Self {
                started: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                max_inflight,
            })
        })
    }

    /// Configured cap.
    pub fn max_inflight(&self) -> u64 {
        self.max_inflight
    }

    /// Requests currently admitted.
    pub fn inflight(&self) -> u64 {
        self.started
            .load(Ordering::SeqCst)
            .wrapping_sub(self.completed.load(Ordering::SeqCst))
    }

    /// Admits one request if the cap allows it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let started = self.started.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let completed = self.completed.load(Ordering::SeqCst);
        if started.wrapping_sub(completed) > self.max_inflight {
            self.completed.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        Some(Permit {
            limiter: Arc::clone(self),
        })
    }
}

/// Middleware answering `429` once the cap is reached.
pub async fn limit(
    State(limiter): State<Arc<ConcurrencyLimiter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(permit) = limiter.try_acquire() else {
        tracing::warn!(max_inflight = limiter.max_inflight, "rejecting request over limit");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Concurrent request limit exceeded. Max concurrent requests: {}\n",
                limiter.max_inflight
            ),
        )
            .into_response();
    };
    req.extensions_mut().insert(HeldPermit::new(permit));
    next.run(req).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_cap_disables_limiting() {
        assert!(ConcurrencyLimiter::new(0).is_none());
    }

    #[test]
    fn admits_up_to_cap() {
        let limiter = ConcurrencyLimiter::new(2).unwrap();
        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.inflight(), 2);

        drop(a);
        assert_eq!(limiter.inflight(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn held_permit_is_taken_once() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let held = HeldPermit::new(limiter.try_acquire().unwrap());
        let copy = held.clone();

        let permit = held.take().unwrap();
        assert!(copy.take().is_none());
        drop(held);
        drop(copy);
        assert_eq!(limiter.inflight(), 1);

        drop(permit);
        assert_eq!(limiter.inflight(), 0);
    }

    #[test]
    fn counters_tolerate_wraparound() {
        let limiter = Arc::new(ConcurrencyLimiter {
            started: AtomicU64::new(u64::MAX),
            completed: AtomicU64::new(u64::MAX),
            max_inflight: 1,
        });
        let permit = limiter.try_acquire().unwrap();
        assert_eq!(limiter.started.load(Ordering::SeqCst), 0);
        assert!(limiter.try_acquire().is_none());
        drop(permit);
        assert_eq!(limiter.inflight(), 0);
    }
}
