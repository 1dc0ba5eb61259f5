use std::time::{Duration, Instant};

/// Leading-edge rate limiter that keeps the latest suppressed value
///
/// `offer` passes a value through when at least `interval` has elapsed since
/// the last emission; otherwise the value replaces any pending one. `flush`
/// hands out the pending value so the final update is never lost.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        let ready = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if ready {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Take the value suppressed since the last emission, if any
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }
}
