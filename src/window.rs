//! Turns operator input (day, time of day, duration, buffers) into an
//! absolute capture window in local wall-clock time.

use crate::{DvrError, Result};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// 2 hours 5 minutes, used when the duration field is left empty.
pub const DEFAULT_DURATION_SECONDS: u64 = 2 * 3600 + 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaySpec {
    Today,
    Tomorrow,
    Date(NaiveDate),
}

impl DaySpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let day = raw.trim().to_ascii_lowercase();
        match day.as_str() {
            "" | "today" => Ok(DaySpec::Today),
            "tomorrow" => Ok(DaySpec::Tomorrow),
            other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
                .map(DaySpec::Date)
                .map_err(|_| DvrError::BadTimeFormat {
                    input: raw.to_string(),
                }),
        }
    }

    fn date(&self, now: NaiveDateTime) -> NaiveDate {
        match self {
            DaySpec::Today => now.date(),
            DaySpec::Tomorrow => now.date() + Duration::days(1),
            DaySpec::Date(d) => *d,
        }
    }

    /// Only "today" (or nothing) may be silently moved to the next day.
    fn rolls_forward(&self) -> bool {
        matches!(self, DaySpec::Today)
    }
}

/// Reported when a "today" start already passed and was moved to tomorrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartAdjustment {
    pub requested: NaiveDateTime,
    pub moved_to: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedWindow {
    /// Buffer-adjusted start.
    pub start_at: NaiveDateTime,
    /// Buffer-adjusted run length.
    pub duration_seconds: u64,
    /// The nominal (pre-buffer) start the operator asked for.
    pub nominal_start: NaiveDateTime,
    pub adjustment: Option<StartAdjustment>,
    /// Set when the start buffer reached back past `now` and was trimmed.
    pub buffer_trim: Option<StartAdjustment>,
}

pub fn resolve(
    day: &str,
    time_of_day: &str,
    duration_spec: &str,
    start_buffer_minutes: Option<u32>,
    end_buffer_minutes: Option<u32>,
) -> Result<ResolvedWindow> {
    resolve_at(
        Local::now().naive_local(),
        day,
        time_of_day,
        duration_spec,
        start_buffer_minutes,
        end_buffer_minutes,
    )
}

pub fn resolve_at(
    now: NaiveDateTime,
    day: &str,
    time_of_day: &str,
    duration_spec: &str,
    start_buffer_minutes: Option<u32>,
    end_buffer_minutes: Option<u32>,
) -> Result<ResolvedWindow> {
    let day = DaySpec::parse(day)?;
    let time = parse_time_of_day(time_of_day)?;
    let duration_seconds = parse_duration(duration_spec)?;

    let requested = day.date(now).and_time(time);
    let (nominal_start, adjustment) = ensure_future(requested, day, now)?;
    let (start_at, duration_seconds) = apply_buffers(
        nominal_start,
        duration_seconds,
        start_buffer_minutes,
        end_buffer_minutes,
    );
    let (start_at, duration_seconds, buffer_trim) =
        clamp_to_future(start_at, duration_seconds, now);

    Ok(ResolvedWindow {
        start_at,
        duration_seconds,
        nominal_start,
        adjustment,
        buffer_trim,
    })
}

/// The nominal start must be in the future; the buffered start is
/// clamped separately by [`clamp_to_future`].
pub fn ensure_future(
    start_at: NaiveDateTime,
    day: DaySpec,
    now: NaiveDateTime,
) -> Result<(NaiveDateTime, Option<StartAdjustment>)> {
    if start_at > now {
        return Ok((start_at, None));
    }
    if day.rolls_forward() {
        let moved_to = start_at + Duration::days(1);
        return Ok((
            moved_to,
            Some(StartAdjustment {
                requested: start_at,
                moved_to,
            }),
        ));
    }
    Err(DvrError::PastStartTime {
        start_at: start_at.format("%Y-%m-%d %H:%M").to_string(),
    })
}

/// A start buffer extends the window backwards; an end buffer only extends
/// the run length.
pub fn apply_buffers(
    start_at: NaiveDateTime,
    duration_seconds: u64,
    start_buffer_minutes: Option<u32>,
    end_buffer_minutes: Option<u32>,
) -> (NaiveDateTime, u64) {
    let mut start_at = start_at;
    let mut duration_seconds = duration_seconds;
    if let Some(mins) = start_buffer_minutes {
        start_at -= Duration::minutes(i64::from(mins));
        duration_seconds += u64::from(mins) * 60;
    }
    if let Some(mins) = end_buffer_minutes {
        duration_seconds += u64::from(mins) * 60;
    }
    (start_at, duration_seconds)
}

/// A buffered start at or before `now` moves to the next whole minute and
/// the run shrinks by the same amount, so the end of the window holds.
pub fn clamp_to_future(
    start_at: NaiveDateTime,
    duration_seconds: u64,
    now: NaiveDateTime,
) -> (NaiveDateTime, u64, Option<StartAdjustment>) {
    if start_at > now {
        return (start_at, duration_seconds, None);
    }
    let moved_to = now
        - Duration::seconds(i64::from(now.second()))
        - Duration::nanoseconds(i64::from(now.nanosecond()))
        + Duration::minutes(1);
    let trimmed = (moved_to - start_at).num_seconds().max(0) as u64;
    (
        moved_to,
        duration_seconds.saturating_sub(trimmed).max(1),
        Some(StartAdjustment {
            requested: start_at,
            moved_to,
        }),
    )
}

pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let re = TIME_RE.get_or_init(|| Regex::new(r"^(\d{1,2}):(\d{2})(?:\s*(am|pm))?$").unwrap());

    let bad = || DvrError::BadTimeFormat {
        input: raw.to_string(),
    };
    let normalized = raw.trim().to_ascii_lowercase();
    let caps = re.captures(&normalized).ok_or_else(bad)?;
    let mut hour: u32 = caps[1].parse().map_err(|_| bad())?;
    let minute: u32 = caps[2].parse().map_err(|_| bad())?;

    if let Some(meridiem) = caps.get(3).map(|m| m.as_str()) {
        if !(1..=12).contains(&hour) {
            return Err(bad());
        }
        if meridiem == "pm" && hour != 12 {
            hour += 12;
        }
        if meridiem == "am" && hour == 12 {
            hour = 0;
        }
    }

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(bad)
}

/// Accepts `HH:MM:SS`, `NhNmNs` (any subset), or a bare number of minutes.
/// Empty input means the default 2h05m.
pub fn parse_duration(raw: &str) -> Result<u64> {
    static HMS_RE: OnceLock<Regex> = OnceLock::new();
    static COMPOSITE_RE: OnceLock<Regex> = OnceLock::new();
    let hms_re = HMS_RE.get_or_init(|| Regex::new(r"^(\d+):(\d{2}):(\d{2})$").unwrap());
    let composite_re = COMPOSITE_RE
        .get_or_init(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

    let bad = || DvrError::BadDurationFormat {
        input: raw.to_string(),
    };
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Ok(DEFAULT_DURATION_SECONDS);
    }

    let field = |value: Option<regex::Match<'_>>| -> Result<u64> {
        match value {
            Some(m) => m.as_str().parse::<u64>().map_err(|_| bad()),
            None => Ok(0),
        }
    };

    let total = if let Some(caps) = hms_re.captures(&s) {
        let (h, m, sec) = (field(caps.get(1))?, field(caps.get(2))?, field(caps.get(3))?);
        h.checked_mul(3600)
            .and_then(|v| v.checked_add(m * 60 + sec))
            .ok_or_else(bad)?
    } else if let Some(caps) = composite_re
        .captures(&s)
        .filter(|c| c.iter().skip(1).any(|g| g.is_some()))
    {
        let (h, m, sec) = (field(caps.get(1))?, field(caps.get(2))?, field(caps.get(3))?);
        h.checked_mul(3600)
            .and_then(|v| v.checked_add(m.checked_mul(60)?))
            .and_then(|v| v.checked_add(sec))
            .ok_or_else(bad)?
    } else if s.chars().all(|c| c.is_ascii_digit()) {
        s.parse::<u64>()
            .ok()
            .and_then(|mins| mins.checked_mul(60))
            .ok_or_else(bad)?
    } else {
        return Err(bad());
    };

    if total == 0 {
        return Err(bad());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").expect("dt")
    }

    #[test]
    fn today_in_the_future_stays_today() {
        let now = at("2025-02-28", "12:00");
        let w = resolve_at(now, "today", "20:00", "1:00:00", None, None).expect("resolve");
        assert_eq!(w.start_at, at("2025-02-28", "20:00"));
        assert_eq!(w.duration_seconds, 3600);
        assert!(w.adjustment.is_none());

        let blank = resolve_at(now, "", "8:00 pm", "", None, None).expect("resolve blank");
        assert_eq!(blank.start_at, at("2025-02-28", "20:00"));
        assert_eq!(blank.duration_seconds, DEFAULT_DURATION_SECONDS);
    }

    #[test]
    fn today_in_the_past_rolls_to_tomorrow_with_notice() {
        let now = at("2025-02-28", "21:00");
        let w = resolve_at(now, "Today", "20:00", "60", None, None).expect("resolve");
        assert_eq!(w.start_at, at("2025-03-01", "20:00"));
        let adj = w.adjustment.expect("adjustment");
        assert_eq!(adj.requested, at("2025-02-28", "20:00"));
        assert_eq!(adj.moved_to, at("2025-03-01", "20:00"));
    }

    #[test]
    fn start_equal_to_now_is_not_in_the_future() {
        let now = at("2025-02-28", "20:00");
        let w = resolve_at(now, "today", "20:00", "60", None, None).expect("resolve");
        assert_eq!(w.start_at, at("2025-03-01", "20:00"));
    }

    #[test]
    fn explicit_past_date_is_rejected() {
        let now = at("2025-02-28", "12:00");
        let err = resolve_at(now, "2025-02-27", "20:00", "60", None, None).expect_err("past");
        assert!(matches!(err, DvrError::PastStartTime { .. }));
        let same_day = resolve_at(now, "2025-02-28", "11:59", "60", None, None).expect_err("past");
        assert!(matches!(same_day, DvrError::PastStartTime { .. }));
    }

    #[test]
    fn buffers_extend_the_window() {
        let now = at("2025-02-28", "12:00");
        let w = resolve_at(now, "2025-03-01", "20:00", "1h", Some(5), Some(2)).expect("resolve");
        assert_eq!(w.start_at, at("2025-03-01", "19:55"));
        assert_eq!(w.duration_seconds, 3900);
        assert_eq!(w.nominal_start, at("2025-03-01", "20:00"));

        let (start, dur) = apply_buffers(at("2025-03-01", "20:00"), 1800, Some(10), None);
        assert_eq!(start, at("2025-03-01", "19:50"));
        assert_eq!(dur, 1800 + 600);

        let (start, dur) = apply_buffers(at("2025-03-01", "20:00"), 1800, None, Some(7));
        assert_eq!(start, at("2025-03-01", "20:00"));
        assert_eq!(dur, 1800 + 420);
    }

    #[test]
    fn buffer_reaching_into_the_past_is_trimmed() {
        let now = at("2025-02-28", "12:00");
        let w = resolve_at(now, "today", "12:03", "30", Some(5), None).expect("resolve");
        assert_eq!(w.start_at, at("2025-02-28", "12:01"));
        assert!(w.start_at > now);
        // Same end as the untrimmed 11:58 + 35 min.
        assert_eq!(w.duration_seconds, 35 * 60 - 3 * 60);
        assert_eq!(w.nominal_start, at("2025-02-28", "12:03"));
        assert!(w.adjustment.is_none());
        let trim = w.buffer_trim.expect("trim notice");
        assert_eq!(trim.requested, at("2025-02-28", "11:58"));
        assert_eq!(trim.moved_to, at("2025-02-28", "12:01"));

        let untouched = resolve_at(now, "today", "12:10", "30", Some(5), None).expect("resolve");
        assert_eq!(untouched.start_at, at("2025-02-28", "12:05"));
        assert!(untouched.buffer_trim.is_none());

        let mid_minute = now + Duration::seconds(20);
        let (start, dur, trim) = clamp_to_future(at("2025-02-28", "11:59"), 600, mid_minute);
        assert_eq!(start, at("2025-02-28", "12:01"));
        assert_eq!(dur, 480);
        assert!(trim.is_some());
    }

    #[test]
    fn time_formats() {
        let t = |s: &str| parse_time_of_day(s).expect(s);
        assert_eq!(t("20:00"), NaiveTime::from_hms_opt(20, 0, 0).expect("t"));
        assert_eq!(t("8:05 PM"), NaiveTime::from_hms_opt(20, 5, 0).expect("t"));
        assert_eq!(t("12:30am"), NaiveTime::from_hms_opt(0, 30, 0).expect("t"));
        assert_eq!(t("12:30 pm"), NaiveTime::from_hms_opt(12, 30, 0).expect("t"));
        for bad in ["25:00", "8pm", "13:00 pm", "0:10 am", "20:61", "noon"] {
            assert!(
                matches!(parse_time_of_day(bad), Err(DvrError::BadTimeFormat { .. })),
                "{bad}"
            );
        }
        assert!(matches!(
            DaySpec::parse("03/01/2025"),
            Err(DvrError::BadTimeFormat { .. })
        ));
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("02:05:00").expect("hms"), 7500);
        assert_eq!(parse_duration("125").expect("minutes"), 7500);
        assert_eq!(parse_duration("2h5m").expect("composite"), 7500);
        assert_eq!(parse_duration("90s").expect("seconds"), 90);
        assert_eq!(parse_duration("1h0m30s").expect("all"), 3630);
        assert_eq!(parse_duration("  ").expect("default"), DEFAULT_DURATION_SECONDS);
        for bad in ["abc", "h", "1:5:00", "0", "0h", "1.5h"] {
            assert!(
                matches!(parse_duration(bad), Err(DvrError::BadDurationFormat { .. })),
                "{bad}"
            );
        }
    }
}
