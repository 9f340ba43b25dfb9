// Timing - Fire-time math for schedule tasks
//
// Everything here is pure: the current time is always passed in, so the
// catch-up rules can be tested without a clock.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;

/// Marker for an unset instant
pub const UNSET: i64 = -1;

/// Error type for schedule timing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("a period of {period_ms}ms requires a start time")]
    PeriodWithoutStart { period_ms: u64 },

    #[error("period '{text}' has no <int>[dhms] duration")]
    EmptyPeriod { text: String },

    #[error("period '{text}' is out of range")]
    PeriodOutOfRange { text: String },

    #[error("next fire time is out of range")]
    OutOfRange,
}

/// Longest accepted period, so grid arithmetic stays within `i64` millis
pub const MAX_PERIOD_MS: u64 = i64::MAX as u64;

/// Resolved timing of one schedule task, all instants in epoch millis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub start: i64,
    pub end: i64,
    pub period_ms: u64,
    pub is_async: bool,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            start: UNSET,
            end: UNSET,
            period_ms: 0,
            is_async: false,
        }
    }
}

impl Timing {
    /// True once `now` has reached a set end instant
    pub fn is_expired(&self, now: i64) -> bool {
        self.end != UNSET && now >= self.end
    }
}

/// When a task should fire next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirePlan {
    /// Past its end instant; never fires
    Expired,
    /// Fire once after `delay` ms
    Once { delay: u64 },
    /// Fire after `delay` ms, then every `period` ms
    Periodic { delay: u64, period: u64 },
}

/// Compute the next fire for `timing` as seen at `now`.
///
/// Before the start instant the first fire is the start itself. Past it, a
/// periodic task skips the missed fires and waits for the next grid point
/// `start + k * period`; a one-shot task fires immediately.
pub fn plan(now: i64, timing: &Timing) -> Result<FirePlan, ScheduleError> {
    if timing.is_expired(now) {
        return Ok(FirePlan::Expired);
    }

    let period = timing.period_ms;
    if period > 0 && timing.start == UNSET {
        return Err(ScheduleError::PeriodWithoutStart { period_ms: period });
    }

    // i128 holds any difference or grid step of i64 instants
    let (now, start, step) = (now as i128, timing.start as i128, period as i128);
    let delay = if timing.start != UNSET && now < start {
        start - now
    } else if period > 0 {
        let times = (now - start) / step + 1;
        let next = times
            .checked_mul(step)
            .and_then(|offset| offset.checked_add(start))
            .filter(|next| *next <= i64::MAX as i128)
            .ok_or(ScheduleError::OutOfRange)?;
        next - now
    } else {
        0
    };
    let delay = u64::try_from(delay).map_err(|_| ScheduleError::OutOfRange)?;

    Ok(if period > 0 {
        FirePlan::Periodic { delay, period }
    } else {
        FirePlan::Once { delay }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

static PERIOD_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)(\d+)([dhms])").ok());

/// Sum every `<int>[dhms]` token of a period string into milliseconds.
///
/// Text without any token, a zero total and totals beyond
/// [`MAX_PERIOD_MS`] are rejected.
pub fn parse_period(text: &str) -> Result<u64, ScheduleError> {
    let out_of_range = || ScheduleError::PeriodOutOfRange { text: text.to_string() };
    let Some(token) = PERIOD_TOKEN.as_ref() else {
        return Err(ScheduleError::EmptyPeriod { text: text.to_string() });
    };

    let mut total: u64 = 0;
    for caps in token.captures_iter(text) {
        let n: u64 = caps[1].parse().map_err(|_| out_of_range())?;
        let unit: u64 = match caps[2].to_ascii_lowercase().as_str() {
            "d" => 86_400_000,
            "h" => 3_600_000,
            "m" => 60_000,
            _ => 1_000,
        };
        total = n
            .checked_mul(unit)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(out_of_range)?;
    }

    match total {
        0 => Err(ScheduleError::EmptyPeriod { text: text.to_string() }),
        ms if ms > MAX_PERIOD_MS => Err(out_of_range()),
        ms => Ok(ms),
    }
}

/// Parse a local date/time with a strftime format into epoch millis.
///
/// Formats without a time part are read as midnight.
pub fn parse_instant(text: &str, format: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text.trim(), format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Render epoch millis for log output
pub fn format_instant(millis: i64, format: &str) -> String {
    if millis == UNSET {
        return "unset".to_string();
    }
    match Local.timestamp_millis_opt(millis).earliest() {
        Some(dt) => dt.format(format).to_string(),
        None => millis.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Source of wall-clock time in epoch millis
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
