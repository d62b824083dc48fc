//! Cancellable delayed retries.
//!
//! Every retry a stream schedules runs under the session's
//! [`CancellationToken`], so tearing the session down stops pending
//! retries deterministically instead of leaving timers behind.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exponential backoff between `base` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(3_200))
    }
}

/// Spawns retry tasks that die with their cancellation token.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    token: CancellationToken,
    policy: BackoffPolicy,
}

impl RetryScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            token: CancellationToken::new(),
            policy,
        }
    }

    /// Scheduler cancelled together with `self` but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            policy: self.policy,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Run `task` after `delay` unless cancelled first.
    ///
    /// Returns `None` when the scheduler is already cancelled.
    pub fn after<F>(&self, delay: Duration, task: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return None;
        }
        let token = self.token.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = async {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    task.await;
                } => {}
            }
        }))
    }

    /// Stop every pending and running task spawned through this scheduler.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
