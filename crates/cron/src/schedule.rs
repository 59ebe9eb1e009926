//! Next-run computation and schedule validation.

use {
    chrono::{DateTime, NaiveDateTime, TimeZone, Utc},
    chrono_tz::Tz,
    cron::Schedule,
};

use crate::{Error, Result, types::ScheduleType};

/// Parse a cron expression.
///
/// Five-field expressions use standard numbering (0 or 7 is Sunday) and are
/// rewritten for the `cron` crate, which wants seconds and year fields and
/// counts weekdays from 1 = Sunday. Six and seven field expressions are
/// passed through unchanged.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let invalid = |message: String| {
        Error::invalid_schedule(format!("invalid cron expression '{expr}': {message}"))
    };
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let dow = crate_day_of_week(fields[4]).map_err(invalid)?;
        format!("0 {} {} {} {} {dow} *", fields[0], fields[1], fields[2], fields[3])
    } else {
        expr.to_string()
    };
    normalized
        .parse::<Schedule>()
        .map_err(|source| Error::CronParse {
            expr: expr.to_string(),
            source,
        })
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// One standard day-of-week token (`0`-`7` or a name) as 0 = Sunday.
fn standard_day(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return match n {
            0..=6 => Ok(n),
            7 => Ok(0),
            _ => Err(format!("day of week out of range: {token}")),
        };
    }
    let upper = token.to_ascii_uppercase();
    DAY_NAMES
        .iter()
        .position(|name| upper.starts_with(name))
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day of week: {token}"))
}

/// Rewrite a standard day-of-week field as an explicit list in the `cron`
/// crate's numbering. Lists, ranges (including ones ending on `7`) and steps
/// are expanded.
fn crate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid step: {item}"))?;
                (range, step)
            },
            None => (item, 1),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            // `7` closes a range as Sunday, so `5-7` is Friday to Sunday.
            let bound = |token: &str| match token.parse::<u32>() {
                Ok(7) => Ok(7),
                _ => standard_day(token),
            };
            (bound(a)?, bound(b)?)
        } else if step > 1 {
            (standard_day(range)?, 6)
        } else {
            let day = standard_day(range)?;
            (day, day)
        };
        if start > end {
            return Err(format!("descending range: {item}"));
        }
        for day in (start..=end).step_by(step as usize) {
            days[(day % 7) as usize] = true;
        }
    }
    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(day, _)| (day + 1).to_string())
        .collect();
    Ok(list.join(","))
}

/// Parse an interval in milliseconds. Zero and negative values are rejected.
pub fn parse_interval(value: &str) -> Result<u64> {
    let ms: i64 = value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_schedule(format!("interval is not a number: {value}")))?;
    if ms <= 0 {
        return Err(Error::invalid_schedule(format!(
            "interval must be positive: {value}"
        )));
    }
    Ok(ms as u64)
}

/// Parse an ISO-8601 timestamp into epoch millis.
///
/// Timestamps without an offset are read in `tz`.
pub fn parse_once(value: &str, tz: Tz) -> Result<u64> {
    let value = value.trim();
    let millis = if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        dt.timestamp_millis()
    } else {
        let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
            .map_err(|e| Error::invalid_schedule(format!("invalid timestamp '{value}': {e}")))?;
        tz.from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| {
                Error::invalid_schedule(format!("timestamp '{value}' does not exist in {tz}"))
            })?
            .timestamp_millis()
    };
    if millis < 0 {
        return Err(Error::invalid_schedule(format!(
            "timestamp is before the epoch: {value}"
        )));
    }
    Ok(millis as u64)
}

/// Check that `value` is well-formed for `kind`.
pub fn validate_schedule(kind: ScheduleType, value: &str, tz: Tz) -> Result<()> {
    match kind {
        ScheduleType::Cron => parse_cron(value).map(|_| ()),
        ScheduleType::Interval => parse_interval(value).map(|_| ()),
        ScheduleType::Once => parse_once(value, tz).map(|_| ()),
    }
}

/// First due time for a newly created task.
pub fn initial_next_run(kind: ScheduleType, value: &str, now_ms: u64, tz: Tz) -> Result<Option<u64>> {
    match kind {
        ScheduleType::Once => parse_once(value, tz).map(Some),
        _ => next_run_after(kind, value, now_ms, tz),
    }
}

/// Due time following a run that started at `started_ms`.
///
/// Cron fires strictly after the start, intervals add to the start and
/// one-shot tasks have nothing left to run.
pub fn next_run_after(
    kind: ScheduleType,
    value: &str,
    started_ms: u64,
    tz: Tz,
) -> Result<Option<u64>> {
    match kind {
        ScheduleType::Once => Ok(None),
        ScheduleType::Interval => Ok(Some(started_ms.saturating_add(parse_interval(value)?))),
        ScheduleType::Cron => {
            let schedule = parse_cron(value)?;
            let start = DateTime::<Utc>::from_timestamp_millis(started_ms as i64)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
                .with_timezone(&tz);
            Ok(schedule
                .after(&start)
                .next()
                .map(|dt| dt.timestamp_millis() as u64))
        },
    }
}
