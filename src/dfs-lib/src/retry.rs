use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;

use crate::DfsError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Injectable clock so backoff is testable without real sleeping.
#[async_trait]
pub trait WallClock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, dur: Duration);
}

pub struct SystemClock;

#[async_trait]
impl WallClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Exponential-backoff policy. State lives in the per-operation [`RetryOp`];
/// the policy itself is shared and immutable.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn start_operation(&self, clock: &dyn WallClock) -> RetryOp {
        RetryOp {
            started_at: clock.now(),
            attempt: 0,
            next_delay: self.initial_delay,
            max_attempts: self.max_attempts,
            max_delay: self.max_delay,
        }
    }
}

pub struct RetryOp {
    started_at: Instant,
    attempt: u32,
    next_delay: Duration,
    max_attempts: u32,
    max_delay: Duration,
}

impl RetryOp {
    /// The number of attempts already made (0 before the first call).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self, clock: &dyn WallClock) -> Duration {
        clock.now().saturating_duration_since(self.started_at)
    }

    /// False once the error is final or the attempts are exhausted.
    pub fn should_retry(&self, err: &DfsError) -> bool {
        err.is_retriable() && self.attempt + 1 < self.max_attempts
    }

    /// Sleeps the current delay on the injected clock, then doubles it up to
    /// the cap. Call only after `should_retry` returned true.
    pub async fn backoff(&mut self, clock: &dyn WallClock) {
        debug!(
            "retry: attempt {} failed, backing off {:?}",
            self.attempt + 1,
            self.next_delay
        );
        clock.sleep(self.next_delay).await;
        self.attempt += 1;
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
    }
}

#[cfg(any(test, feature = "test-util"))]
pub struct FakeClock {
    base: Instant,
    state: std::sync::Mutex<FakeClockState>,
}

#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
struct FakeClockState {
    advanced: Duration,
    sleeps: Vec<Duration>,
}

#[cfg(any(test, feature = "test-util"))]
impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: std::sync::Mutex::new(FakeClockState::default()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }

    /// Moves the clock forward without recording a sleep.
    pub fn advance(&self, dur: Duration) {
        self.state.lock().unwrap().advanced += dur;
    }

    pub fn total_slept(&self) -> Duration {
        self.state.lock().unwrap().sleeps.iter().sum()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl WallClock for FakeClock {
    fn now(&self) -> Instant {
        let state = self.state.lock().unwrap();
        self.base + state.advanced
    }

    async fn sleep(&self, dur: Duration) {
        let mut state = self.state.lock().unwrap();
        state.sleeps.push(dur);
        state.advanced += dur;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> DfsError {
        DfsError::Transport("reset".to_string())
    }

    #[tokio::test]
    async fn test_backoff_doubles_up_to_cap() {
        let clock = FakeClock::new();
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
        };
        let mut op = policy.start_operation(&clock);
        for _ in 0..5 {
            assert!(op.should_retry(&transport()));
            op.backoff(&clock).await;
        }
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[tokio::test]
    async fn test_attempt_limit() {
        let clock = FakeClock::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let mut op = policy.start_operation(&clock);
        assert!(op.should_retry(&transport()));
        op.backoff(&clock).await;
        assert!(op.should_retry(&transport()));
        op.backoff(&clock).await;
        // Third attempt is the last one allowed.
        assert!(!op.should_retry(&transport()));
    }

    #[tokio::test]
    async fn test_single_attempt_never_retries() {
        let clock = FakeClock::new();
        let policy = RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        let op = policy.start_operation(&clock);
        assert!(!op.should_retry(&transport()));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_non_retriable_error_is_final() {
        let clock = FakeClock::new();
        let op = RetryPolicy::default().start_operation(&clock);
        assert!(!op.should_retry(&DfsError::NotFound("gone".to_string())));
        assert!(!op.should_retry(&DfsError::PermissionDenied("no".to_string())));
        assert!(op.should_retry(&DfsError::RemoteUnavailable("standby".to_string())));
    }

    #[tokio::test]
    async fn test_elapsed_follows_fake_clock() {
        let clock = FakeClock::new();
        let policy = RetryPolicy::default();
        let mut op = policy.start_operation(&clock);
        op.backoff(&clock).await;
        assert_eq!(op.elapsed(&clock), Duration::from_millis(50));
    }
}
