//! `datetimeoffset(n)`: UTC time of day, UTC days since 0001-01-01, then the
//! offset in minutes as a signed 16-bit integer.

use bytes::{BufMut, BytesMut};
use chrono::FixedOffset;
use smallvec::smallvec;

use super::temporal::{self, YEAR_ONE};
use super::{DataType, EncodeOptions, Parameter, ParameterData, SmallBytes, SqlValue, Value};
use crate::tds::error::{ConnectionError, ConnectionResult, ValidationError};

const OFFSET_LENGTH: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct DateTimeOffset;

impl DataType for DateTimeOffset {
    fn id(&self) -> u8 {
        0x2B
    }

    fn name(&self) -> &'static str {
        "DateTimeOffset"
    }

    fn declaration(&self, parameter: &Parameter) -> String {
        format!("datetimeoffset({})", parameter.scale().unwrap_or(7))
    }

    fn resolve_scale(&self, parameter: &Parameter) -> Option<u8> {
        match parameter.scale() {
            Some(scale) => Some(scale),
            None if parameter.is_null() => Some(0),
            None => Some(7),
        }
    }

    fn type_info(&self, parameter: &Parameter) -> SmallBytes {
        smallvec![self.id(), parameter.scale().unwrap_or(7)]
    }

    fn parameter_length(&self, parameter: &Parameter, _options: &EncodeOptions) -> SmallBytes {
        if parameter.is_null() {
            return smallvec![0];
        }
        let scale = parameter.scale().unwrap_or(7);
        smallvec![(temporal::time_length(scale) + 3 + OFFSET_LENGTH) as u8]
    }

    // Naive values take their offset from the encoding zone. Time and days
    // are stored in UTC either way.
    fn parameter_data(&self, parameter: &Parameter, options: &EncodeOptions) -> ParameterData {
        let Some(value) = parameter.value().and_then(|v| temporal::resolve(v, options)) else {
            return ParameterData::empty();
        };
        let scale = parameter.scale().unwrap_or(7);
        ParameterData::once(move || {
            let utc = EncodeOptions {
                use_utc: true,
                ..EncodeOptions::default()
            };
            let mut buf = BytesMut::with_capacity(10);
            let time = temporal::scaled_time(temporal::nanos_of_day(&value, &utc), scale);
            temporal::put_time(&mut buf, time, scale);
            temporal::put_days(&mut buf, temporal::day_count(&value, YEAR_ONE, &utc));
            buf.put_i16_le((value.offset().local_minus_utc() / 60) as i16);
            buf.freeze()
        })
    }

    fn validate(&self, value: Value) -> Result<Option<SqlValue>, ValidationError> {
        temporal::validate_temporal("DateTimeOffset", value)
    }

    fn decode(&self, data: &[u8], scale: u8) -> ConnectionResult<SqlValue> {
        let (time, days) = temporal::split_time_and_days("DateTimeOffset", data, scale, OFFSET_LENGTH)?;
        let nanos = temporal::nanos_from_scaled(temporal::read_uint_le(time), scale)?;
        let days = temporal::read_uint_le(days) as i64;
        let utc = temporal::datetime_from_parts(YEAR_ONE, days, nanos)?.and_utc();

        let tail = &data[data.len() - OFFSET_LENGTH..];
        let minutes = i16::from_le_bytes([tail[0], tail[1]]) as i32;
        let offset = FixedOffset::east_opt(minutes * 60)
            .ok_or_else(|| ConnectionError::protocol(format!("Invalid offset: {} minutes", minutes)))?;
        Ok(SqlValue::DateTime(utc.with_timezone(&offset)))
    }
}
