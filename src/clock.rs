use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Source of the current UTC instant. Everything that needs the time takes a
/// Clock so tests can drive it; wall-clock reads outside implementations of
/// this trait are off limits.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
#[error("countdown timer has already been started")]
pub struct AlreadyStarted;

/// Counts down a fixed duration from the instant `start` is called.
pub struct CountdownTimer {
    duration: Duration,
    clock: Arc<dyn Clock>,
    started_at: Option<DateTime<Utc>>,
}

impl CountdownTimer {
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            duration,
            clock,
            started_at: None,
        }
    }

    pub fn start(&mut self) -> Result<(), AlreadyStarted> {
        if self.started_at.is_some() {
            return Err(AlreadyStarted);
        }
        self.started_at = Some(self.clock.now_utc());
        Ok(())
    }

    /// Time left before expiry, never negative. Before `start` the full
    /// duration remains.
    pub fn remaining(&self) -> Duration {
        match self.started_at {
            Some(started_at) => {
                let elapsed = self.clock.now_utc() - started_at;
                (self.duration - elapsed).max(Duration::zero())
            }
            None => self.duration,
        }
    }

    pub fn expired(&self) -> bool {
        self.remaining() <= Duration::zero()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Clock mapped onto the tokio test clock: `tokio::time::advance` (or
    /// auto-advanced sleeps under `start_paused`) move it forward from the
    /// given epoch. Construct inside a runtime.
    pub struct TokioClock {
        epoch: DateTime<Utc>,
        started: tokio::time::Instant,
    }

    impl TokioClock {
        pub fn at(epoch: DateTime<Utc>) -> Self {
            Self {
                epoch,
                started: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now_utc(&self) -> DateTime<Utc> {
            self.epoch + Duration::from_std(self.started.elapsed()).unwrap_or_default()
        }
    }

    /// Clock pinned to a single instant, for pure computations.
    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now_utc(&self) -> DateTime<Utc> {
            self.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TokioClock;
    use super::*;

    fn epoch() -> DateTime<Utc> {
        "2024-01-15T08:00:00Z".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down_and_clamps_at_zero() {
        let clock = Arc::new(TokioClock::at(epoch()));
        let mut timer = CountdownTimer::new(Duration::seconds(10), clock);

        assert_eq!(timer.remaining(), Duration::seconds(10));
        assert!(!timer.expired());

        timer.start().unwrap();
        tokio::time::advance(std::time::Duration::from_secs(4)).await;
        assert_eq!(timer.remaining(), Duration::seconds(6));

        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        assert_eq!(timer.remaining(), Duration::zero());
        assert!(timer.expired());

        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        assert_eq!(timer.remaining(), Duration::zero());
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_is_an_error() {
        let clock = Arc::new(TokioClock::at(epoch()));
        let mut timer = CountdownTimer::new(Duration::seconds(1), clock);
        timer.start().unwrap();
        assert!(timer.start().is_err());
    }
}
