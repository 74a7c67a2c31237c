use std::time::{Duration, Instant};

use crate::error::{HarnessError, Result};

/// Interval and deadline for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Calls `probe` until it yields a value or the deadline expires.
///
/// `Ok(Some(v))` finishes the wait, `Ok(None)` keeps polling and `Err`
/// aborts immediately. The probe always runs at least once, and once more
/// right at the deadline if the last sleep crossed it.
pub fn poll_until<T, F>(what: &str, settings: PollSettings, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(value) = probe()? {
            tracing::trace!(what, attempts, elapsed = ?start.elapsed(), "poll satisfied");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            return Err(HarnessError::Timeout {
                what: what.to_string(),
                waited: elapsed,
            });
        }

        let remaining = settings.timeout - elapsed;
        std::thread::sleep(settings.interval.min(remaining));
    }
}
