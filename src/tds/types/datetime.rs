//! `datetime`: days since 1900-01-01 plus 1/300-second ticks since midnight.

use bytes::{BufMut, BytesMut};
use smallvec::smallvec;

use super::temporal::{self, DATETIME_EPOCH};
use super::{DataType, EncodeOptions, Parameter, ParameterData, SmallBytes, SqlValue, Value};
use crate::tds::error::{ConnectionError, ConnectionResult, ValidationError};

/// Type id of the nullable datetime family used on the wire.
const DATETIMEN: u8 = 0x6F;

/// Tick count of one full day; a value rounding to it belongs to the next day.
const TICKS_PER_DAY: u64 = 25_920_000;

#[derive(Debug, Clone, Copy)]
pub struct DateTime;

/// Day and tick fields for a value.
fn days_and_ticks(value: &chrono::DateTime<chrono::FixedOffset>, options: &EncodeOptions) -> (i64, u64) {
    let mut days = temporal::day_count(value, DATETIME_EPOCH, options);
    // Only millisecond precision reaches the tick computation
    let milliseconds = (temporal::nanos_of_day(value, options) / 1_000_000) as f64;
    // round(ms / (3 + 1/3)), evaluated in floating point
    let mut ticks = (milliseconds / (3.0 + 1.0 / 3.0)).round() as u64;
    if ticks == TICKS_PER_DAY {
        days += 1;
        ticks = 0;
    }
    (days, ticks)
}

impl DataType for DateTime {
    fn id(&self) -> u8 {
        0x3D
    }

    fn name(&self) -> &'static str {
        "DateTime"
    }

    fn declaration(&self, _parameter: &Parameter) -> String {
        "datetime".to_string()
    }

    fn type_info(&self, _parameter: &Parameter) -> SmallBytes {
        smallvec![DATETIMEN, 0x08]
    }

    fn parameter_length(&self, parameter: &Parameter, _options: &EncodeOptions) -> SmallBytes {
        if parameter.is_null() {
            smallvec![0]
        } else {
            smallvec![8]
        }
    }

    fn parameter_data(&self, parameter: &Parameter, options: &EncodeOptions) -> ParameterData {
        let Some(value) = parameter.value().and_then(|v| temporal::resolve(v, options)) else {
            return ParameterData::empty();
        };
        let options = *options;
        ParameterData::once(move || {
            let (days, ticks) = days_and_ticks(&value, &options);
            let mut buf = BytesMut::with_capacity(8);
            buf.put_i32_le(days as i32);
            buf.put_u32_le(ticks as u32);
            buf.freeze()
        })
    }

    fn validate(&self, value: Value) -> Result<Option<SqlValue>, ValidationError> {
        temporal::validate_temporal("DateTime", value)
    }

    fn decode(&self, data: &[u8], _scale: u8) -> ConnectionResult<SqlValue> {
        let (days, nanos) = match data.len() {
            8 => {
                let days = i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64;
                let ticks = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as i64;
                // round(ticks * 10 / 3) milliseconds
                let milliseconds = (ticks * 10 + 1) / 3;
                (days, milliseconds * 1_000_000)
            }
            // smalldatetime: days and minutes
            4 => {
                let days = u16::from_le_bytes([data[0], data[1]]) as i64;
                let minutes = u16::from_le_bytes([data[2], data[3]]) as i64;
                (days, minutes * 60_000_000_000)
            }
            n => {
                return Err(ConnectionError::protocol(format!("Invalid DateTime length: {}", n)));
            }
        };
        let datetime = temporal::datetime_from_parts(DATETIME_EPOCH, days, nanos)?;
        Ok(SqlValue::DateTime(datetime.and_utc().fixed_offset()))
    }
}
