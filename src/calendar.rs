//! Wall-clock to absolute time conversion.
//!
//! Slots are written in the tenant's local time; everything stored is UTC
//! milliseconds. Conversion goes through the IANA database so DST shifts are
//! handled per date.

use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{Ms, SlotTime, Span};

pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::Validation(format!("unknown timezone {name:?}")))
}

/// UTC instant of `time` on `date` in `tz`.
///
/// A local time skipped by a spring-forward transition has no instant and is
/// rejected. A repeated local time (fall-back) resolves to the earlier one.
pub fn wall_clock_to_utc(date: NaiveDate, time: SlotTime, tz: Tz) -> Result<Ms, EngineError> {
    let local = date.and_time(time.to_naive_time());
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "{date} {time} does not exist in {} (daylight saving gap)",
                tz.name()
            ))
        })
}

/// Absolute span for a wall-clock interval on one date.
pub fn local_span(date: NaiveDate, start: SlotTime, end: SlotTime, tz: Tz) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "interval must start before it ends ({start} - {end})"
        )));
    }
    let start_ms = wall_clock_to_utc(date, start, tz)?;
    let end_ms = wall_clock_to_utc(date, end, tz)?;
    if start_ms >= end_ms {
        return Err(EngineError::Validation(format!(
            "{start} - {end} on {date} collapses across a clock change"
        )));
    }
    let span = Span::new(start_ms, end_ms);
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}
