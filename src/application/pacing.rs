use std::time::Duration;

use tokio::time::Instant;

/// Spaces task starts so the remote service never sees a burst.
///
/// Tracks the earliest instant the next task may start. Every scheduled task
/// pushes that instant one interval past the later of itself and now, so N
/// tasks submitted together start one interval apart, also right after an
/// idle period.
#[derive(Debug, Clone)]
pub struct PacingClock {
    next_start: Option<Instant>,
    interval: Duration,
    penalty: Duration,
}

impl PacingClock {
    pub fn new(interval: Duration, penalty: Duration) -> Self {
        Self {
            next_start: None,
            interval,
            penalty,
        }
    }

    /// Delay a task scheduled at `now` must sleep before starting, including
    /// the penalty when it replaces a transfer that had to be interrupted.
    /// Advances the clock.
    pub fn schedule(&mut self, now: Instant, penalize: bool) -> Duration {
        let next_start = self.next_start.unwrap_or(now);
        let mut delay = next_start.saturating_duration_since(now);
        if penalize {
            delay += self.penalty;
        }
        self.next_start = Some(now.max(next_start) + self.interval);
        delay
    }
}
