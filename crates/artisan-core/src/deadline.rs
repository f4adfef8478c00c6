//! Soft deadlines and the polling loop shared by every backend.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::Result;

/// Longest sleep between two polls of a running command.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A point in time after which waiting stops. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left, recomputed from now. `None` for an unbounded deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Remaining time capped at `cap`, for slicing a long wait into bounded steps.
    pub fn slice(&self, cap: Duration) -> Duration {
        self.remaining().map_or(cap, |r| r.min(cap))
    }
}

/// Call `poll` until it reports completion or the deadline passes.
///
/// `poll` always runs at least once, so a zero deadline still performs one
/// non-blocking check. Returns whether `poll` reported completion.
pub async fn poll_until<F, Fut>(deadline: Deadline, mut poll: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    loop {
        if poll().await? {
            return Ok(true);
        }
        match deadline.remaining() {
            Some(remaining) if remaining.is_zero() => return Ok(false),
            Some(remaining) => tokio::time::sleep(remaining.min(POLL_INTERVAL)).await,
            None => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_zero_deadline_polls_exactly_once() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let done = poll_until(Deadline::after(Some(Duration::ZERO)), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, crate::Error>(false)
        })
        .await
        .unwrap();

        assert!(!done);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_when_poll_completes() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let done = poll_until(Deadline::never(), move || async move {
            Ok::<_, crate::Error>(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();

        assert!(done);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_respects_deadline() {
        let start = Instant::now();
        let done = poll_until(Deadline::after(Some(Duration::from_millis(120))), || async {
            Ok::<_, crate::Error>(false)
        })
        .await
        .unwrap();

        assert!(!done);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(120));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_slice_caps_unbounded_deadline() {
        let cap = Duration::from_secs(2);
        assert_eq!(Deadline::never().slice(cap), cap);
        assert!(Deadline::after(Some(Duration::from_millis(10))).slice(cap) <= cap);
    }
}
