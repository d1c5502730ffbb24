//! Fixed-rate pacing

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

use super::CancelToken;
use crate::InitializationError;

const DT_WINDOW: usize = 100;

/// Anything the pipeline can block on once per iteration
pub trait Tick: Send {
    /// Wait for the next slot. Returns true if the previous iteration overran
    /// the lag threshold.
    fn tick(&mut self, cancel: &CancelToken) -> bool;
}

/// Keeps a loop on a fixed schedule. Slots are `interval` apart from the
/// first deadline and never re-anchored, so short overruns are absorbed by
/// skipping the sleep instead of drifting the schedule.
pub struct Ratekeeper {
    interval: Duration,
    next_frame_time: Instant,
    last_monitor_time: Instant,
    print_delay_threshold: Option<Duration>,
    frame: u64,
    remaining: f64,
    dts: VecDeque<Duration>,
}

/// Slot length for `rate_hz`. The rate must be positive, finite and large
/// enough that one slot still fits on the monotonic clock.
pub fn tick_interval(rate_hz: f64) -> Result<Duration, InitializationError> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return Err(InitializationError::InvalidRate(rate_hz));
    }
    Duration::try_from_secs_f64(1.0 / rate_hz)
        .ok()
        .filter(|&interval| Instant::now().checked_add(interval).is_some())
        .ok_or(InitializationError::InvalidRate(rate_hz))
}

impl Ratekeeper {
    pub fn new(
        rate_hz: f64,
        print_delay_threshold: Option<Duration>,
    ) -> Result<Self, InitializationError> {
        let interval = tick_interval(rate_hz)?;
        let now = Instant::now();
        let next_frame_time = now
            .checked_add(interval)
            .ok_or(InitializationError::InvalidRate(rate_hz))?;
        let mut dts = VecDeque::with_capacity(DT_WINDOW);
        dts.push_back(interval);
        Ok(Self {
            interval,
            next_frame_time,
            last_monitor_time: now,
            print_delay_threshold,
            frame: 0,
            remaining: 0.0,
            dts,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ticks taken so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Seconds left in the current slot at the last tick; negative when late
    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// True when the recent average tick interval is more than 1/0.9 of the target
    pub fn lagging(&self) -> bool {
        let avg = self.dts.iter().sum::<Duration>() / self.dts.len() as u32;
        avg.as_secs_f64() > self.interval.as_secs_f64() / 0.9
    }

    /// Record timing and advance the schedule without sleeping.
    /// Returns true when lagging past the print threshold.
    pub fn monitor_time(&mut self) -> bool {
        let now = Instant::now();
        if self.dts.len() == DT_WINDOW {
            self.dts.pop_front();
        }
        self.dts.push_back(now - self.last_monitor_time);
        self.last_monitor_time = now;

        let remaining = signed_secs(self.next_frame_time, now);
        self.next_frame_time += self.interval;

        let mut lagged = false;
        if let Some(threshold) = self.print_delay_threshold {
            if remaining < -threshold.as_secs_f64() {
                warn!("camerad lagging by {:.2} ms", -remaining * 1000.0);
                lagged = true;
            }
        }
        self.frame += 1;
        self.remaining = remaining;
        lagged
    }

    /// Sleep until the next slot
    pub fn keep_time(&mut self, cancel: &CancelToken) -> bool {
        let lagged = self.monitor_time();
        if self.remaining > 0.0 {
            cancel.sleep(Duration::from_secs_f64(self.remaining));
        }
        lagged
    }
}

impl Tick for Ratekeeper {
    fn tick(&mut self, cancel: &CancelToken) -> bool {
        self.keep_time(cancel)
    }
}

fn signed_secs(deadline: Instant, now: Instant) -> f64 {
    match deadline.checked_duration_since(now) {
        Some(ahead) => ahead.as_secs_f64(),
        None => -(now - deadline).as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_the_target_rate() {
        let cancel = CancelToken::new();
        let mut rk = Ratekeeper::new(100.0, None).unwrap();
        let start = Instant::now();
        for _ in 0..10 {
            rk.keep_time(&cancel);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(95), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert_eq!(rk.frame(), 10);
    }

    #[test]
    fn overrun_is_reported_and_absorbed() {
        let cancel = CancelToken::new();
        let mut rk = Ratekeeper::new(200.0, Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(rk.keep_time(&cancel));
        assert!(rk.remaining() < 0.0);

        // The schedule was not re-anchored, so the next slot is also late
        // and the loop catches up without sleeping.
        let start = Instant::now();
        rk.keep_time(&cancel);
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn lagging_tracks_average_interval() {
        let cancel = CancelToken::new();
        let mut rk = Ratekeeper::new(1000.0, None).unwrap();
        assert!(!rk.lagging());
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(5));
            rk.keep_time(&cancel);
        }
        assert!(rk.lagging());
    }

    #[test]
    fn cancelled_token_skips_the_sleep() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut rk = Ratekeeper::new(1.0, None).unwrap();
        let start = Instant::now();
        rk.keep_time(&cancel);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn rejects_rates_without_a_representable_slot() {
        for rate in [0.0, -5.0, f64::NAN, f64::INFINITY, 1e-20, 1e-300, f64::MIN_POSITIVE] {
            assert!(
                matches!(
                    Ratekeeper::new(rate, None),
                    Err(InitializationError::InvalidRate(_))
                ),
                "{rate}"
            );
        }
        assert_eq!(tick_interval(20.0).unwrap(), Duration::from_millis(50));
    }
}
