//! Bounded polling.
//!
//! Every wait in the driver is a fixed number of attempts with a fixed sleep
//! between them, never a wall-clock deadline. The attempt budget is part of
//! the failure contract, so all loops go through [`poll_until`].

use std::thread;
use std::time::Duration;

/// Outcome of a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The probe succeeded on attempt number `attempts` (1-based).
    Ready { attempts: u32 },
    /// The probe never succeeded; it ran exactly `attempts` times.
    Exhausted { attempts: u32 },
}

impl Poll {
    pub fn is_ready(&self) -> bool {
        matches!(self, Poll::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            Poll::Ready { attempts } | Poll::Exhausted { attempts } => attempts,
        }
    }
}

/// Run `probe` at most `max_attempts` times, sleeping `interval` after each
/// attempt that returns `Ok(false)`.
///
/// An `Err` from the probe aborts the poll immediately and is returned as-is.
pub fn poll_until<E, F>(max_attempts: u32, interval: Duration, mut probe: F) -> Result<Poll, E>
where
    F: FnMut() -> Result<bool, E>,
{
    for attempt in 1..=max_attempts {
        if probe()? {
            return Ok(Poll::Ready { attempts: attempt });
        }
        if attempt < max_attempts && !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    Ok(Poll::Exhausted {
        attempts: max_attempts,
    })
}

/// Sleep for `ms` milliseconds; zero is a no-op.
pub(crate) fn sleep_ms(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_on_first_attempt() {
        let result: Result<Poll, ()> = poll_until(10, Duration::ZERO, || Ok(true));
        assert_eq!(result, Ok(Poll::Ready { attempts: 1 }));
    }

    #[test]
    fn test_ready_after_some_attempts() {
        let mut calls = 0;
        let result: Result<Poll, ()> = poll_until(10, Duration::ZERO, || {
            calls += 1;
            Ok(calls == 4)
        });
        assert_eq!(result, Ok(Poll::Ready { attempts: 4 }));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_exhausted_runs_exact_budget() {
        let mut calls = 0u32;
        let result: Result<Poll, ()> = poll_until(1000, Duration::ZERO, || {
            calls += 1;
            Ok(false)
        });
        assert_eq!(result, Ok(Poll::Exhausted { attempts: 1000 }));
        assert_eq!(calls, 1000);
        assert!(!result.unwrap().is_ready());
    }

    #[test]
    fn test_error_aborts_immediately() {
        let mut calls = 0;
        let result: Result<Poll, &str> = poll_until(10, Duration::ZERO, || {
            calls += 1;
            if calls == 2 { Err("io") } else { Ok(false) }
        });
        assert_eq!(result, Err("io"));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_zero_budget_never_probes() {
        let mut calls = 0;
        let result: Result<Poll, ()> = poll_until(0, Duration::ZERO, || {
            calls += 1;
            Ok(true)
        });
        assert_eq!(result, Ok(Poll::Exhausted { attempts: 0 }));
        assert_eq!(calls, 0);
    }
}
