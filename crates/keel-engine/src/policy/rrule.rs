//! A subset of RFC 5545 recurrence rules.
//!
//! Supported parts: `FREQ` (`HOURLY`, `DAILY`, `WEEKLY`, `MONTHLY`),
//! `INTERVAL`, `BYDAY` (without ordinals), `BYHOUR`, `BYMINUTE`,
//! `BYMONTHDAY`, `COUNT`, `UNTIL` and `WKST` (parsed, weeks always start on
//! Monday). Occurrences are expanded in local time of the rule's timezone.

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
    Utc, Weekday,
};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Periods scanned past the first candidate period before giving up.
const MAX_PERIODS: u64 = 100_000;

/// Occurrences merged into one window at most.
const MAX_MERGED: usize = 1_000;

/// Recurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    /// Every `INTERVAL` hours.
    Hourly,
    /// Every `INTERVAL` days.
    Daily,
    /// Every `INTERVAL` weeks.
    Weekly,
    /// Every `INTERVAL` months.
    Monthly,
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    /// Frequency.
    pub freq: Frequency,
    /// Step between periods, at least 1.
    pub interval: u32,
    /// Weekday filter or expansion.
    pub by_day: Vec<Weekday>,
    /// Hours of the day.
    pub by_hour: Vec<u32>,
    /// Minutes of the hour.
    pub by_minute: Vec<u32>,
    /// Days of the month.
    pub by_month_day: Vec<u32>,
    /// Total occurrences from the start.
    pub count: Option<u32>,
    /// Last instant an occurrence may start.
    pub until: Option<DateTime<Utc>>,
}

fn invalid(message: impl std::fmt::Display) -> Error {
    Error::validation(format!("invalid rrule: {message}"))
}

fn parse_list(value: &str, max: u32, min: u32, part: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for item in value.split(',') {
        let n: u32 = item
            .trim()
            .parse()
            .map_err(|_| invalid(format!("{part} value '{item}'")))?;
        if n < min || n > max {
            return Err(invalid(format!("{part} value {n} out of range")));
        }
        out.push(n);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn parse_weekday(token: &str) -> Result<Weekday> {
    Ok(match token.trim() {
        "MO" => Weekday::Mon,
        "TU" => Weekday::Tue,
        "WE" => Weekday::Wed,
        "TH" => Weekday::Thu,
        "FR" => Weekday::Fri,
        "SA" => Weekday::Sat,
        "SU" => Weekday::Sun,
        other => return Err(invalid(format!("BYDAY value '{other}'"))),
    })
}

fn parse_until(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
        return Ok(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| invalid(format!("UNTIL value '{value}'")))
}

impl FromStr for RecurrenceRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s.trim();
        let body = body.strip_prefix("RRULE:").unwrap_or(body);
        let mut freq = None;
        let mut rule = Self {
            freq: Frequency::Daily,
            interval: 1,
            by_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_month_day: Vec::new(),
            count: None,
            until: None,
        };
        for part in body.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(format!("part '{part}'")))?;
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.trim() {
                        "HOURLY" => Frequency::Hourly,
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        other => return Err(invalid(format!("unsupported FREQ '{other}'"))),
                    });
                }
                "INTERVAL" => {
                    rule.interval = value
                        .trim()
                        .parse()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| invalid(format!("INTERVAL value '{value}'")))?;
                }
                "BYDAY" => {
                    rule.by_day = value.split(',').map(parse_weekday).collect::<Result<_>>()?;
                }
                "BYHOUR" => rule.by_hour = parse_list(value, 23, 0, "BYHOUR")?,
                "BYMINUTE" => rule.by_minute = parse_list(value, 59, 0, "BYMINUTE")?,
                "BYMONTHDAY" => rule.by_month_day = parse_list(value, 31, 1, "BYMONTHDAY")?,
                "COUNT" => {
                    rule.count = Some(
                        value
                            .trim()
                            .parse()
                            .map_err(|_| invalid(format!("COUNT value '{value}'")))?,
                    );
                }
                "UNTIL" => rule.until = Some(parse_until(value.trim())?),
                "WKST" => {
                    parse_weekday(value)?;
                }
                other => return Err(invalid(format!("unsupported part '{other}'"))),
            }
        }
        rule.freq = freq.ok_or_else(|| invalid("FREQ is required"))?;
        Ok(rule)
    }
}

fn to_utc(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Midnight of 1970-01-01 in `tz`, the default anchor.
#[must_use]
pub fn default_anchor(tz: Tz) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| to_utc(tz, d.and_time(NaiveTime::MIN)))
        .unwrap_or_default()
}

/// Iterator over occurrence start instants in ascending order.
#[derive(Debug)]
pub struct Occurrences<'a> {
    rule: &'a RecurrenceRule,
    tz: Tz,
    dtstart: DateTime<Utc>,
    anchor: NaiveDateTime,
    period: u64,
    last_period: u64,
    buffer: VecDeque<DateTime<Utc>>,
    emitted: u32,
}

impl RecurrenceRule {
    /// Occurrences starting at `dtstart`, skipping periods that end before
    /// `from` when no `COUNT` forces a scan from the beginning.
    #[must_use]
    pub fn occurrences(&self, tz: Tz, dtstart: DateTime<Utc>, from: DateTime<Utc>) -> Occurrences<'_> {
        let anchor = dtstart.with_timezone(&tz).naive_local();
        let first = if self.count.is_some() {
            0
        } else {
            self.period_near(anchor, from.with_timezone(&tz).naive_local())
        };
        Occurrences {
            rule: self,
            tz,
            dtstart,
            anchor,
            period: first,
            last_period: first.saturating_add(MAX_PERIODS),
            buffer: VecDeque::new(),
            emitted: 0,
        }
    }

    fn period_near(&self, anchor: NaiveDateTime, target: NaiveDateTime) -> u64 {
        if target <= anchor {
            return 0;
        }
        let interval = i64::from(self.interval);
        let elapsed = match self.freq {
            Frequency::Hourly => (target - anchor).num_hours() / interval,
            Frequency::Daily => (target.date() - anchor.date()).num_days() / interval,
            Frequency::Weekly => (target.date() - anchor.date()).num_days() / 7 / interval,
            Frequency::Monthly => {
                let months = (i64::from(target.year()) - i64::from(anchor.year())) * 12
                    + i64::from(target.month())
                    - i64::from(anchor.month());
                months / interval
            }
        };
        u64::try_from(elapsed.saturating_sub(1)).unwrap_or(0)
    }

    fn times(&self, anchor: NaiveDateTime) -> Vec<NaiveTime> {
        let hours = if self.by_hour.is_empty() {
            vec![anchor.hour()]
        } else {
            self.by_hour.clone()
        };
        let minutes = if self.by_minute.is_empty() {
            vec![anchor.minute()]
        } else {
            self.by_minute.clone()
        };
        hours
            .iter()
            .flat_map(|h| minutes.iter().filter_map(move |m| NaiveTime::from_hms_opt(*h, *m, anchor.second())))
            .collect()
    }

    fn day_allowed(&self, date: NaiveDate) -> bool {
        (self.by_day.is_empty() || self.by_day.contains(&date.weekday()))
            && (self.by_month_day.is_empty() || self.by_month_day.contains(&date.day()))
    }

    fn expand(&self, anchor: NaiveDateTime, period: u64) -> Option<Vec<NaiveDateTime>> {
        let step = period.checked_mul(u64::from(self.interval))?;
        let step_i = i64::try_from(step).ok()?;
        let mut out = Vec::new();
        match self.freq {
            Frequency::Hourly => {
                let base = anchor
                    .date()
                    .and_hms_opt(anchor.hour(), 0, 0)?
                    .checked_add_signed(Duration::try_hours(step_i)?)?;
                let hour_ok = self.by_hour.is_empty() || self.by_hour.contains(&base.hour());
                if hour_ok && self.day_allowed(base.date()) {
                    let minutes = if self.by_minute.is_empty() {
                        vec![anchor.minute()]
                    } else {
                        self.by_minute.clone()
                    };
                    for m in minutes {
                        out.push(base.date().and_hms_opt(base.hour(), m, anchor.second())?);
                    }
                }
            }
            Frequency::Daily => {
                let date = anchor.date().checked_add_signed(Duration::try_days(step_i)?)?;
                if self.day_allowed(date) {
                    out.extend(self.times(anchor).into_iter().map(|t| date.and_time(t)));
                }
            }
            Frequency::Weekly => {
                let monday = anchor.date()
                    - Duration::days(i64::from(anchor.weekday().num_days_from_monday()));
                let week = monday.checked_add_signed(Duration::try_days(step_i.checked_mul(7)?)?)?;
                let days: Vec<Weekday> = if self.by_day.is_empty() {
                    vec![anchor.weekday()]
                } else {
                    self.by_day.clone()
                };
                for offset in 0..7 {
                    let date = week + Duration::days(offset);
                    if days.contains(&date.weekday())
                        && (self.by_month_day.is_empty() || self.by_month_day.contains(&date.day()))
                    {
                        out.extend(self.times(anchor).into_iter().map(|t| date.and_time(t)));
                    }
                }
            }
            Frequency::Monthly => {
                let first = anchor
                    .date()
                    .with_day(1)?
                    .checked_add_months(Months::new(u32::try_from(step).ok()?))?;
                let days: Vec<NaiveDate> = if !self.by_month_day.is_empty() {
                    self.by_month_day
                        .iter()
                        .filter_map(|d| first.with_day(*d))
                        .filter(|d| self.by_day.is_empty() || self.by_day.contains(&d.weekday()))
                        .collect()
                } else if !self.by_day.is_empty() {
                    first
                        .iter_days()
                        .take_while(|d| d.month() == first.month())
                        .filter(|d| self.by_day.contains(&d.weekday()))
                        .collect()
                } else {
                    first.with_day(anchor.day()).into_iter().collect()
                };
                for date in days {
                    out.extend(self.times(anchor).into_iter().map(|t| date.and_time(t)));
                }
            }
        }
        out.sort();
        Some(out)
    }
}

impl Iterator for Occurrences<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<DateTime<Utc>> {
        loop {
            if let Some(next) = self.buffer.pop_front() {
                if self.rule.until.is_some_and(|until| next > until) {
                    self.period = self.last_period;
                    self.buffer.clear();
                    return None;
                }
                if let Some(count) = self.rule.count {
                    if self.emitted >= count {
                        return None;
                    }
                }
                self.emitted += 1;
                return Some(next);
            }
            if self.period >= self.last_period {
                return None;
            }
            let candidates = self.rule.expand(self.anchor, self.period);
            self.period += 1;
            let Some(candidates) = candidates else {
                self.period = self.last_period;
                continue;
            };
            self.buffer.extend(
                candidates
                    .into_iter()
                    .filter_map(|local| to_utc(self.tz, local))
                    .filter(|t| *t >= self.dtstart),
            );
        }
    }
}

/// Where `now` falls relative to a rule's windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Inside a window that closes at `end`.
    Inside {
        /// Start of the (merged) window.
        start: DateTime<Utc>,
        /// Instant the window closes.
        end: DateTime<Utc>,
    },
    /// Outside every window.
    Outside {
        /// Start of the next window, if any.
        next_start: Option<DateTime<Utc>>,
    },
}

/// Classifies `now` against windows of `duration` starting at each occurrence.
/// Overlapping or touching windows are merged.
#[must_use]
pub fn window_state(
    rule: &RecurrenceRule,
    tz: Tz,
    dtstart: DateTime<Utc>,
    duration: Duration,
    now: DateTime<Utc>,
) -> WindowState {
    let mut inside: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for start in rule.occurrences(tz, dtstart, now - duration).take(MAX_MERGED) {
        let end = start + duration;
        match inside {
            Some((open, close)) => {
                if start > close {
                    break;
                }
                inside = Some((open, close.max(end)));
            }
            None => {
                if start > now {
                    return WindowState::Outside {
                        next_start: Some(start),
                    };
                }
                if end > now {
                    inside = Some((start, end));
                }
            }
        }
    }
    match inside {
        Some((start, end)) => WindowState::Inside { start, end },
        None => WindowState::Outside { next_start: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_supported_parts() {
        let rule: RecurrenceRule = "RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=SA,SU;BYHOUR=22;COUNT=4"
            .parse()
            .unwrap();
        assert_eq!(rule.freq, Frequency::Weekly);
        assert_eq!(rule.interval, 2);
        assert_eq!(rule.by_day, vec![Weekday::Sat, Weekday::Sun]);
        assert_eq!(rule.count, Some(4));
        assert!("FREQ=YEARLY".parse::<RecurrenceRule>().is_err());
        assert!("BYHOUR=2".parse::<RecurrenceRule>().is_err());
        assert!("FREQ=DAILY;BYHOUR=24".parse::<RecurrenceRule>().is_err());
    }

    #[test]
    fn daily_occurrences_in_timezone() {
        let rule: RecurrenceRule = "FREQ=DAILY;BYHOUR=9;BYMINUTE=30".parse().unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let start = utc("2024-01-01T00:00:00Z");
        let got: Vec<_> = rule.occurrences(tz, start, start).take(2).collect();
        assert_eq!(got, vec![utc("2024-01-01T14:30:00Z"), utc("2024-01-02T14:30:00Z")]);
    }

    #[test]
    fn count_and_until_bound_the_series() {
        let tz = chrono_tz::UTC;
        let start = utc("2024-03-01T10:00:00Z");
        let counted: RecurrenceRule = "FREQ=HOURLY;INTERVAL=6;COUNT=3".parse().unwrap();
        assert_eq!(counted.occurrences(tz, start, start).count(), 3);

        let until: RecurrenceRule = "FREQ=DAILY;UNTIL=20240303T100000Z".parse().unwrap();
        let days: Vec<_> = until.occurrences(tz, start, start).collect();
        assert_eq!(days.len(), 3);
    }

    #[test]
    fn monthly_by_month_day_skips_short_months() {
        let rule: RecurrenceRule = "FREQ=MONTHLY;BYMONTHDAY=31;BYHOUR=0;BYMINUTE=0".parse().unwrap();
        let start = utc("2024-01-01T00:00:00Z");
        let got: Vec<_> = rule.occurrences(chrono_tz::UTC, start, start).take(3).collect();
        assert_eq!(
            got,
            vec![
                utc("2024-01-31T00:00:00Z"),
                utc("2024-03-31T00:00:00Z"),
                utc("2024-05-31T00:00:00Z")
            ]
        );
    }

    #[test]
    fn window_state_inside_and_outside() {
        let rule: RecurrenceRule = "FREQ=WEEKLY;BYDAY=SA;BYHOUR=0;BYMINUTE=0".parse().unwrap();
        let tz = chrono_tz::UTC;
        let anchor = default_anchor(tz);
        let saturday = utc("2024-06-01T05:00:00Z");
        assert_eq!(
            window_state(&rule, tz, anchor, Duration::hours(48), saturday),
            WindowState::Inside {
                start: utc("2024-06-01T00:00:00Z"),
                end: utc("2024-06-03T00:00:00Z")
            }
        );
        let wednesday = utc("2024-06-05T12:00:00Z");
        assert_eq!(
            window_state(&rule, tz, anchor, Duration::hours(48), wednesday),
            WindowState::Outside {
                next_start: Some(utc("2024-06-08T00:00:00Z"))
            }
        );
    }

    #[test]
    fn overlapping_windows_merge() {
        let rule: RecurrenceRule = "FREQ=HOURLY".parse().unwrap();
        let tz = chrono_tz::UTC;
        let start = utc("2024-01-01T00:00:00Z");
        let now = utc("2024-01-01T00:30:00Z");
        match window_state(&rule, tz, start, Duration::minutes(90), now) {
            WindowState::Inside { start: open, end } => {
                assert_eq!(open, start);
                assert!(end >= utc("2024-01-01T02:30:00Z"));
            }
            WindowState::Outside { .. } => panic!("expected to be inside"),
        }
    }
}
