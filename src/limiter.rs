//! Token-bucket pacing for outbound connect attempts.
//!
//! The Polymarket WebSocket endpoints tolerate only short connect bursts;
//! every socket open goes through [`BurstLimiter::schedule`]. Message sends
//! are not rate limited.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Token bucket gating connect attempts.
///
/// Permits at most `max_burst` acquisitions per rolling `window`; waiters
/// are served in FIFO order. The default matches the upstream allowance of
/// 5 connects per second.
#[derive(Debug)]
pub struct BurstLimiter {
    max_burst: usize,
    window: Duration,
    /// Acquisition timestamps inside the current window.
    recent: Mutex<VecDeque<Instant>>,
    /// Fair queue: tokio mutexes wake waiters in FIFO order, so holding
    /// this across the wait keeps acquisitions ordered.
    queue: tokio::sync::Mutex<()>,
}

impl BurstLimiter {
    pub fn new(max_burst: usize, window: Duration) -> Self {
        Self {
            max_burst: max_burst.max(1),
            window,
            recent: Mutex::new(VecDeque::new()),
            queue: tokio::sync::Mutex::new(()),
        }
    }

    /// Run `task` once a token is available, returning its output.
    pub async fn schedule<F>(&self, task: F) -> F::Output
    where
        F: Future,
    {
        self.acquire().await;
        task.await
    }

    async fn acquire(&self) {
        let _queued = self.queue.lock().await;
        loop {
            let wait = {
                let mut recent = self.recent.lock();
                let cutoff = Instant::now().checked_sub(self.window);
                while let (Some(cut), Some(front)) = (cutoff, recent.front()) {
                    if *front <= cut {
                        recent.pop_front();
                    } else {
                        break;
                    }
                }
                if recent.len() < self.max_burst {
                    recent.push_back(Instant::now());
                    None
                } else {
                    let oldest = recent
                        .front()
                        .copied()
                        .unwrap_or_else(Instant::now);
                    Some(self.window.saturating_sub(oldest.elapsed()))
                }
            };
            match wait {
                None => return,
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "connect burst exhausted");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Tokens still available in the current window.
    pub fn available(&self) -> usize {
        let mut recent = self.recent.lock();
        let cutoff = Instant::now().checked_sub(self.window);
        while let (Some(cut), Some(front)) = (cutoff, recent.front()) {
            if *front <= cut {
                recent.pop_front();
            } else {
                break;
            }
        }
        self.max_burst - recent.len().min(self.max_burst)
    }
}

impl Default for BurstLimiter {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_passes_without_delay() {
        let limiter = BurstLimiter::new(3, Duration::from_millis(200));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.schedule(async {}).await;
        }
        assert!(start.elapsed() < Duration::from_millis(150));
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_acquisition_beyond_burst_waits_for_window() {
        let limiter = BurstLimiter::new(2, Duration::from_millis(120));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.schedule(async {}).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_schedule_returns_task_output() {
        let limiter = BurstLimiter::default();
        let out = limiter.schedule(async { 7 }).await;
        assert_eq!(out, 7);
        assert_eq!(limiter.available(), 4);
    }

    #[tokio::test]
    async fn test_window_replenishes() {
        let limiter = BurstLimiter::new(2, Duration::from_millis(50));
        limiter.schedule(async {}).await;
        limiter.schedule(async {}).await;
        assert_eq!(limiter.available(), 0);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(limiter.available(), 2);
    }
}
