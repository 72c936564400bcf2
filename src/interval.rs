//! Item update intervals
//!
//! A delay expression is a simple interval optionally followed by flexible
//! intervals that override it during a weekly time period:
//!
//! ```text
//! 30s
//! 5m;10s/1-5,09:00-18:00
//! 1h;0/6-7,00:00-24:00
//! ```
//!
//! Weekdays are numbered 1 (Monday) to 7 (Sunday). A flexible delay of zero
//! suspends checks for the period.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Longest accepted delay
pub const MAX_DELAY_SECS: u64 = 86_400;

const SECS_PER_YEAR: i64 = 365 * 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("empty delay")]
    Empty,

    #[error("invalid delay \"{0}\"")]
    InvalidDelay(String),

    #[error("delay \"{0}\" exceeds one day")]
    TooLong(String),

    #[error("invalid time period \"{0}\"")]
    InvalidPeriod(String),

    #[error("delay \"{0}\" never schedules a check")]
    NeverScheduled(String),
}

/// Weekly time period `d[-d],hh:mm-hh:mm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePeriod {
    pub day_from: u32,
    pub day_to: u32,
    /// Seconds since midnight, inclusive
    pub start: u32,
    /// Seconds since midnight, exclusive
    pub end: u32,
}

impl TimePeriod {
    pub fn parse(text: &str) -> Result<Self, IntervalError> {
        let invalid = || IntervalError::InvalidPeriod(text.to_string());

        let (days, times) = text.split_once(',').ok_or_else(invalid)?;
        let (day_from, day_to) = match days.split_once('-') {
            Some((from, to)) => (parse_weekday(from), parse_weekday(to)),
            None => (parse_weekday(days), parse_weekday(days)),
        };
        let (day_from, day_to) = day_from.zip(day_to).ok_or_else(invalid)?;
        if day_from > day_to {
            return Err(invalid());
        }

        let (start, end) = times.split_once('-').ok_or_else(invalid)?;
        let start = parse_clock(start).ok_or_else(invalid)?;
        let end = parse_clock(end).ok_or_else(invalid)?;
        if start >= end {
            return Err(invalid());
        }

        Ok(Self {
            day_from,
            day_to,
            start,
            end,
        })
    }

    fn covers_day(&self, weekday: u32) -> bool {
        (self.day_from..=self.day_to).contains(&weekday)
    }

    /// Whether the local time falls inside the period
    pub fn contains<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> bool {
        let weekday = time.weekday().number_from_monday();
        let seconds = time.num_seconds_from_midnight();
        self.covers_day(weekday) && (self.start..self.end).contains(&seconds)
    }
}

fn parse_weekday(text: &str) -> Option<u32> {
    match text.parse::<u32>() {
        Ok(day @ 1..=7) if text.len() == 1 => Some(day),
        _ => None,
    }
}

fn parse_clock(text: &str) -> Option<u32> {
    let (hours, minutes) = text.split_once(':')?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return None;
    }
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if minutes > 59 || hours > 24 || (hours == 24 && minutes != 0) {
        return None;
    }
    Some(hours * 3600 + minutes * 60)
}

/// Parse `<number>[s|m|h|d|w]` into seconds
pub fn parse_duration(text: &str) -> Option<u64> {
    let (digits, multiplier) = match text.chars().last()? {
        's' => (&text[..text.len() - 1], 1),
        'm' => (&text[..text.len() - 1], 60),
        'h' => (&text[..text.len() - 1], 3600),
        'd' => (&text[..text.len() - 1], 86_400),
        'w' => (&text[..text.len() - 1], 7 * 86_400),
        _ => (text, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexibleInterval {
    pub delay: u64,
    pub period: TimePeriod,
}

/// Parsed delay expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delay {
    pub simple: u64,
    pub flexible: Vec<FlexibleInterval>,
}

impl Delay {
    pub fn every(seconds: u64) -> Self {
        Self {
            simple: seconds,
            flexible: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, IntervalError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(IntervalError::Empty);
        }

        let mut parts = text.split(';');
        let simple = parts
            .next()
            .and_then(parse_duration)
            .ok_or_else(|| IntervalError::InvalidDelay(text.to_string()))?;
        if simple > MAX_DELAY_SECS {
            return Err(IntervalError::TooLong(text.to_string()));
        }

        let mut flexible = Vec::new();
        for part in parts {
            let (delay, period) = part
                .split_once('/')
                .ok_or_else(|| IntervalError::InvalidDelay(part.to_string()))?;
            let delay =
                parse_duration(delay).ok_or_else(|| IntervalError::InvalidDelay(part.to_string()))?;
            if delay > MAX_DELAY_SECS {
                return Err(IntervalError::TooLong(part.to_string()));
            }
            flexible.push(FlexibleInterval {
                delay,
                period: TimePeriod::parse(period)?,
            });
        }

        if simple == 0 && flexible.iter().all(|f| f.delay == 0) {
            return Err(IntervalError::NeverScheduled(text.to_string()));
        }

        Ok(Self { simple, flexible })
    }

    /// Delay in effect at the given local time; the shortest active flexible
    /// interval wins
    pub fn current_delay<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> u64 {
        self.flexible
            .iter()
            .filter(|f| f.period.contains(time))
            .map(|f| f.delay)
            .min()
            .unwrap_or(self.simple)
    }

    /// Next moment after `time` at which a flexible period starts or ends
    fn next_change<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let timezone = time.timezone();
        let today = time.date_naive();
        let mut earliest: Option<DateTime<Tz>> = None;

        for offset in 0..=7 {
            let Some(day) = today.checked_add_signed(Duration::days(offset)) else {
                break;
            };
            let weekday = day.weekday().number_from_monday();
            let midnight = day.and_time(NaiveTime::MIN);

            for flex in self.flexible.iter().filter(|f| f.period.covers_day(weekday)) {
                for seconds in [flex.period.start, flex.period.end] {
                    let local = midnight + Duration::seconds(i64::from(seconds));
                    let Some(candidate) = timezone.from_local_datetime(&local).earliest() else {
                        continue;
                    };
                    if candidate > *time && earliest.as_ref().is_none_or(|e| candidate < *e) {
                        earliest = Some(candidate);
                    }
                }
            }
        }

        earliest
    }

    /// Next check time strictly after `now`
    ///
    /// Checks are aligned to slots of the current delay offset by
    /// `seed % delay`, so items with the same delay spread across the
    /// interval. Returns `None` when no check falls within the next year.
    pub fn next_check<Tz: TimeZone>(&self, seed: u64, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        if self.flexible.is_empty() {
            let at = aligned_slot(self.simple, seed, now.timestamp())?;
            return DateTime::from_timestamp(at, 0);
        }

        let limit = now.timestamp() + SECS_PER_YEAR;
        let mut current = now.clone();

        while current.timestamp() < limit {
            let delay = self.current_delay(&current);
            let change = self.next_change(&current);

            if delay != 0 {
                let at = aligned_slot(delay, seed, current.timestamp())?;
                match &change {
                    Some(change) if change.timestamp() <= at => {}
                    _ => return DateTime::from_timestamp(at, 0),
                }
            }

            current = change?;
        }

        None
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.simple)?;
        for flex in &self.flexible {
            write!(
                f,
                ";{}s/{}-{},{:02}:{:02}-{:02}:{:02}",
                flex.delay,
                flex.period.day_from,
                flex.period.day_to,
                flex.period.start / 3600,
                flex.period.start % 3600 / 60,
                flex.period.end / 3600,
                flex.period.end % 3600 / 60
            )?;
        }
        Ok(())
    }
}

fn aligned_slot(delay: u64, seed: u64, after: i64) -> Option<i64> {
    let delay = i64::try_from(delay).ok().filter(|d| *d > 0)?;
    let offset = i64::try_from(seed % delay as u64).ok()?;
    let mut slot = delay * after.div_euclid(delay) + offset;
    while slot <= after {
        slot += delay;
    }
    Some(slot)
}
