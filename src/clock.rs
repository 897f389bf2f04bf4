//! Wall-clock access for the control loops.
//!
//! Every worker asks a [`Clock`] for the time instead of calling
//! `Local::now()` directly, so tests can drive schedules with a
//! [`ManualClock`].
use chrono::{DateTime, Duration, Local, NaiveTime, Timelike};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fires once every `period`, catching up by whole periods when a check
/// arrives late so the schedule never drifts.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    next: DateTime<Local>,
}

impl Ticker {
    /// First tick is due immediately.
    pub fn new(period: Duration, now: DateTime<Local>) -> Self {
        Self { period, next: now }
    }

    /// First tick is due one period from `now`.
    pub fn delayed(period: Duration, now: DateTime<Local>) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    pub fn ready(&mut self, now: DateTime<Local>) -> bool {
        if now < self.next {
            return false;
        }
        if self.period <= Duration::zero() {
            self.next = now;
            return true;
        }
        while self.next <= now {
            self.next = self.next + self.period;
        }
        true
    }

    /// Restart the schedule so the next tick is one period from `now`.
    pub fn reset(&mut self, now: DateTime<Local>) {
        self.next = now + self.period;
    }

    pub fn next_due(&self) -> DateTime<Local> {
        self.next
    }
}

/// Convert fractional seconds into a chrono duration.
pub fn seconds(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

const MAX_OFFSET_MILLIS: f64 = 1e16;

/// `from` plus fractional seconds, or `None` when the result is not a
/// representable instant.
pub fn checked_after(from: DateTime<Local>, secs: f64) -> Option<DateTime<Local>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round();
    // Well past chrono's date range but inside what `Duration` can hold
    if millis.abs() > MAX_OFFSET_MILLIS {
        return None;
    }
    from.checked_add_signed(Duration::milliseconds(millis as i64))
}

/// Fractional seconds between two instants (negative when `to` precedes `from`).
pub fn secs_between(from: DateTime<Local>, to: DateTime<Local>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Parse a "HH:MM" time of day.
pub fn parse_hour_minute(value: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid time of day '{}': {}", value, e))
}

/// Whether `now` lies within `[start, end]`, compared at minute resolution.
/// A window whose end precedes its start wraps past midnight.
pub fn within_span(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    let now = minute_of_day(now);
    let start = minute_of_day(start);
    let end = minute_of_day(end);
    if start <= end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}

pub fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}
