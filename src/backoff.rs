//! Retry pacing shared by log tailing, LSN waits and source reads
//!
//! A [`BackoffPolicy`] maps a 1-based attempt number to the delay before
//! that attempt, or `None` once the policy gives up. Attempt 1 is always
//! immediate. Sleeping goes through a [`Clock`] so tests can substitute
//! [`FakeClock`] and observe the schedule without waiting.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;

/// Cooperative stop flag with broadcast wake-up
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and wakes every waiter
    pub fn request(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.changed.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `timeout` unless stopped first. Returns `true` if stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.changed.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Time source used for every retry sleep
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    /// Sleeps for `delay` or until `stop` is raised. Returns `true` if stopped.
    fn sleep_unless(&self, stop: &StopSignal, delay: Duration) -> bool;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_unless(&self, stop: &StopSignal, delay: Duration) -> bool {
        if delay.is_zero() {
            return stop.is_requested();
        }
        stop.wait_timeout(delay)
    }
}

/// Virtual clock: sleeping advances time instantly and is recorded
#[derive(Debug)]
pub struct FakeClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn sleep_unless(&self, stop: &StopSignal, delay: Duration) -> bool {
        self.sleeps.lock().push(delay);
        *self.elapsed.lock() += delay;
        // Let real threads on the other side of the test make progress
        std::thread::yield_now();
        stop.is_requested()
    }
}

/// Maps attempt numbers to delays
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Delay before `attempt` (1-based); `None` once the policy gives up
    fn delay(&self, attempt: u32) -> Option<Duration>;

    /// Longest delay the policy ever returns
    fn max_delay(&self) -> Duration;
}

/// Immediate first retry, then a constant interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        match attempt {
            0 | 1 => Some(Duration::ZERO),
            n if n > self.max_attempts => None,
            _ => Some(self.interval),
        }
    }

    fn max_delay(&self) -> Duration {
        self.interval
    }
}

/// Immediate first retry, then `initial * multiplier^(n-2)` capped at `max`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
    /// Adds up to 25% random extra delay
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(500),
            multiplier: 2,
            max_attempts: 20,
            jitter: false,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return Some(Duration::ZERO);
        }
        if attempt > self.max_attempts {
            return None;
        }
        let mut delay = self.initial;
        for _ in 2..attempt {
            delay = delay.saturating_mul(self.multiplier.max(1));
            if delay >= self.max {
                break;
            }
        }
        let mut delay = delay.min(self.max);
        if self.jitter && !delay.is_zero() {
            let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            delay += Duration::from_millis(extra_ms);
        }
        Some(delay)
    }

    fn max_delay(&self) -> Duration {
        if self.jitter {
            self.max + self.max / 4
        } else {
            self.max
        }
    }
}

/// Runs `op` until it succeeds or the policy gives up.
///
/// `op` receives the attempt number. The last error is returned when the
/// policy is exhausted or the stop signal is raised.
pub fn retry<T, E>(
    policy: &dyn BackoffPolicy,
    clock: &dyn Clock,
    stop: &StopSignal,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                match policy.delay(attempt) {
                    Some(delay) => {
                        if clock.sleep_unless(stop, delay) {
                            return Err(err);
                        }
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

/// Default policy used when none is configured
pub fn default_policy() -> Arc<dyn BackoffPolicy> {
    Arc::new(ExponentialBackoff::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fixed_backoff_schedule() {
        let policy = FixedBackoff {
            interval: Duration::from_millis(50),
            max_attempts: 3,
        };
        assert_eq!(policy.delay(1), Some(Duration::ZERO));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay(3), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay(4), None);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = ExponentialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(35),
            multiplier: 2,
            max_attempts: 6,
            jitter: false,
        };
        let delays: Vec<_> = (1..=7).map(|n| policy.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::ZERO),
                Some(Duration::from_millis(10)),
                Some(Duration::from_millis(20)),
                Some(Duration::from_millis(35)),
                Some(Duration::from_millis(35)),
                Some(Duration::from_millis(35)),
                None,
            ]
        );
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = ExponentialBackoff {
            jitter: true,
            ..ExponentialBackoff::default()
        };
        for attempt in 2..=policy.max_attempts {
            let delay = policy.delay(attempt).unwrap();
            assert!(delay <= policy.max_delay());
        }
    }

    #[test]
    fn test_retry_records_schedule_on_fake_clock() {
        let clock = FakeClock::new();
        let stop = StopSignal::new();
        let policy = FixedBackoff {
            interval: Duration::from_millis(100),
            max_attempts: 4,
        };

        let result: Result<(), &str> = retry(&policy, &clock, &stop, |_| Err("busy"));

        assert_eq!(result, Err("busy"));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
        assert_eq!(clock.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_returns_first_success() {
        let clock = FakeClock::new();
        let stop = StopSignal::new();
        let policy = FixedBackoff {
            interval: Duration::from_millis(5),
            max_attempts: 10,
        };

        let result: Result<u32, ()> =
            retry(&policy, &clock, &stop, |attempt| if attempt == 3 { Ok(attempt) } else { Err(()) });

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_stop_signal_wakes_sleeper() {
        let stop = Arc::new(StopSignal::new());
        let sleeper = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || stop.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        stop.request();
        assert!(sleeper.join().unwrap());
    }

    #[test]
    fn test_system_clock_sleep_times_out() {
        let stop = StopSignal::new();
        assert!(!SystemClock.sleep_unless(&stop, Duration::from_millis(5)));
    }
}
