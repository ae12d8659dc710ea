//! Shared helpers for the temporal data types.
//!
//! Epochs are kept as day numbers counted from 0001-01-01 (CE day 1), so the
//! day arithmetic stays in plain integers.

use bytes::{BufMut, BytesMut};
use chrono::{
    DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta,
    TimeZone, Timelike,
};
use chrono_tz::Tz;

use crate::tds::error::{ConnectionError, ConnectionResult, ValidationError};
use crate::tds::types::{SqlValue, Value};

pub(super) const MS_PER_DAY: i64 = 86_400_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SEC;

/// 0001-01-01, epoch of date, datetime2 and datetimeoffset.
pub(super) const YEAR_ONE: i32 = 1;
/// 1900-01-01, epoch of datetime.
pub(super) const DATETIME_EPOCH: i32 = 693_596;
/// 1970-01-01.
const UNIX_EPOCH: i32 = 719_163;

/// Time zone used when encoding with `use_utc` off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTimeZone {
    /// The process time zone, including its daylight saving rules.
    System,
    /// A named IANA zone, including its historical offsets.
    Zone(Tz),
    Fixed(FixedOffset),
}

impl LocalTimeZone {
    /// Seconds east of UTC in effect at a UTC instant.
    fn offset_at_utc(&self, utc: &NaiveDateTime) -> i64 {
        match self {
            LocalTimeZone::System => Local.offset_from_utc_datetime(utc).fix().local_minus_utc() as i64,
            LocalTimeZone::Zone(tz) => tz.offset_from_utc_datetime(utc).fix().local_minus_utc() as i64,
            LocalTimeZone::Fixed(offset) => offset.local_minus_utc() as i64,
        }
    }

    /// Seconds east of UTC in effect at local midnight of a CE day number.
    fn offset_at_local_midnight(&self, day: i32) -> i64 {
        NaiveDate::from_num_days_from_ce_opt(day)
            .map(|date| self.offset_at_local(&date.and_time(NaiveTime::MIN)))
            .map_or(0, |offset| offset.local_minus_utc() as i64)
    }

    /// Offset of a wall-clock time. A time skipped by a forward shift takes
    /// the offset in effect before the shift.
    fn offset_at_local(&self, local: &NaiveDateTime) -> FixedOffset {
        match self {
            LocalTimeZone::System => local_offset(&Local, local),
            LocalTimeZone::Zone(tz) => local_offset(tz, local),
            LocalTimeZone::Fixed(offset) => *offset,
        }
    }
}

fn local_offset<Z: TimeZone>(zone: &Z, local: &NaiveDateTime) -> FixedOffset {
    match zone.offset_from_local_datetime(local).earliest() {
        Some(offset) => offset.fix(),
        None => zone.offset_from_utc_datetime(local).fix(),
    }
}

/// Options applied while encoding temporal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Count days and read the clock in UTC rather than in `time_zone`.
    pub use_utc: bool,
    pub time_zone: LocalTimeZone,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            use_utc: true,
            time_zone: LocalTimeZone::System,
        }
    }
}

/// The instant a validated value encodes to.
///
/// Values carrying an offset are used as is. Naive values are read on the
/// UTC clock, or on the wall clock of `options.time_zone` when `use_utc` is off.
pub(super) fn resolve(value: &SqlValue, options: &EncodeOptions) -> Option<DateTime<FixedOffset>> {
    match value {
        SqlValue::DateTime(v) => Some(*v),
        SqlValue::NaiveDateTime(v) if options.use_utc => Some(v.and_utc().fixed_offset()),
        SqlValue::NaiveDateTime(v) => {
            let offset = options.time_zone.offset_at_local(v);
            let utc = *v - TimeDelta::seconds(offset.local_minus_utc() as i64);
            Some(DateTime::from_naive_utc_and_offset(utc, offset))
        }
        SqlValue::BigInt(_) => None,
    }
}

/// Whole days from `epoch` to `value`.
///
/// In local mode the count is taken against local midnight of the epoch,
/// corrected by the difference between the value's and the epoch's offsets.
pub(super) fn day_count(value: &DateTime<FixedOffset>, epoch: i32, options: &EncodeOptions) -> i64 {
    let epoch_ms = (epoch - UNIX_EPOCH) as i64 * MS_PER_DAY;
    let value_ms = value.timestamp_millis();

    if options.use_utc {
        return (value_ms - epoch_ms).div_euclid(MS_PER_DAY);
    }

    let epoch_offset = options.time_zone.offset_at_local_midnight(epoch) * 1000;
    let value_offset = options.time_zone.offset_at_utc(&value.naive_utc()) * 1000;
    let local_epoch_ms = epoch_ms - epoch_offset;
    let dst_diff = value_offset - epoch_offset;
    (value_ms - local_epoch_ms + dst_diff).div_euclid(MS_PER_DAY)
}

/// Nanoseconds since midnight on the UTC or local wall clock.
pub(super) fn nanos_of_day(value: &DateTime<FixedOffset>, options: &EncodeOptions) -> i64 {
    let utc = value.naive_utc();
    let time = utc.time();
    // Leap seconds report nanoseconds past 1e9
    let nanos = time.nanosecond().min(999_999_999) as i64;
    let utc_nanos = time.num_seconds_from_midnight() as i64 * NANOS_PER_SEC + nanos;
    let shift = if options.use_utc {
        0
    } else {
        options.time_zone.offset_at_utc(&utc) * NANOS_PER_SEC
    };
    (utc_nanos + shift).rem_euclid(NANOS_PER_DAY)
}

/// Time of day in units of 10^-scale seconds, rounded half up.
pub(super) fn scaled_time(nanos_of_day: i64, scale: u8) -> u64 {
    let units = nanos_of_day as u128 * 10u128.pow(scale as u32);
    ((units + NANOS_PER_SEC as u128 / 2) / NANOS_PER_SEC as u128) as u64
}

/// Width of the time field for a scale: 3, 4 or 5 bytes.
pub(super) fn time_length(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3 | 4 => 4,
        _ => 5,
    }
}

pub(super) fn put_time(buf: &mut BytesMut, time: u64, scale: u8) {
    buf.put_uint_le(time, time_length(scale));
}

pub(super) fn put_days(buf: &mut BytesMut, days: i64) {
    buf.put_uint_le(days as u64 & 0x00FF_FFFF, 3);
}

/// Validation shared by every temporal type.
///
/// Input without an offset stays naive; its zone is applied when encoding.
pub(super) fn validate_temporal(type_name: &'static str, value: Value) -> Result<Option<SqlValue>, ValidationError> {
    let invalid = || ValidationError::new(type_name, "Invalid date.");
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::DateTime(v) => SqlValue::DateTime(v),
        Value::NaiveDateTime(v) => SqlValue::NaiveDateTime(v),
        Value::Date(d) => SqlValue::NaiveDateTime(d.and_time(NaiveTime::MIN)),
        Value::Text(s) => parse_literal(&s).ok_or_else(invalid)?,
        Value::Int(_) | Value::Wide(_) | Value::Float(_) => return Err(invalid()),
    };

    let year = match &parsed {
        SqlValue::DateTime(v) => v.naive_utc().year(),
        SqlValue::NaiveDateTime(v) => v.year(),
        SqlValue::BigInt(_) => return Err(invalid()),
    };
    if !(1..=9999).contains(&year) {
        return Err(invalid());
    }
    Ok(Some(parsed))
}

/// Parse a date/time literal, keeping it naive when it has no offset.
fn parse_literal(s: &str) -> Option<SqlValue> {
    let s = s.trim();
    if let Ok(v) = DateTime::parse_from_rfc3339(s) {
        return Some(SqlValue::DateTime(v));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f %:z"] {
        if let Ok(v) = DateTime::parse_from_str(s, fmt) {
            return Some(SqlValue::DateTime(v));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(v) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(SqlValue::NaiveDateTime(v));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| SqlValue::NaiveDateTime(d.and_time(NaiveTime::MIN)))
}

// ============================================================================
// Decoding
// ============================================================================

pub(super) fn read_uint_le(data: &[u8]) -> u64 {
    data.iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// UTC date-time from a day number relative to `epoch` plus nanoseconds into that day.
pub(super) fn datetime_from_parts(epoch: i32, days: i64, nanos: i64) -> ConnectionResult<NaiveDateTime> {
    let day = i32::try_from(epoch as i64 + days)
        .map_err(|_| ConnectionError::protocol(format!("Day count {} out of range", days)))?;
    NaiveDate::from_num_days_from_ce_opt(day)
        .map(|date| date.and_time(NaiveTime::MIN))
        .and_then(|midnight| midnight.checked_add_signed(TimeDelta::nanoseconds(nanos)))
        .ok_or_else(|| ConnectionError::protocol(format!("Day count {} out of range", days)))
}

/// Nanoseconds represented by a scaled time field.
pub(super) fn nanos_from_scaled(time: u64, scale: u8) -> ConnectionResult<i64> {
    let nanos = time as i128 * 10i128.pow(9 - scale.min(7) as u32);
    i64::try_from(nanos)
        .map_err(|_| ConnectionError::protocol(format!("Time field {} out of range for scale {}", time, scale)))
}

/// Split a datetime2-style payload (time field then 3-byte days) and check its length.
pub(super) fn split_time_and_days<'a>(
    type_name: &str,
    data: &'a [u8],
    scale: u8,
    trailing: usize,
) -> ConnectionResult<(&'a [u8], &'a [u8])> {
    let time_len = time_length(scale);
    if data.len() != time_len + 3 + trailing {
        return Err(ConnectionError::protocol(format!(
            "Invalid {} length {} for scale {}",
            type_name,
            data.len(),
            scale
        )));
    }
    Ok((&data[..time_len], &data[time_len..time_len + 3]))
}
