//! `datetime2(n)`: scaled time of day followed by days since 0001-01-01.

use bytes::BytesMut;
use smallvec::smallvec;

use super::temporal::{self, YEAR_ONE};
use super::{DataType, EncodeOptions, Parameter, ParameterData, SmallBytes, SqlValue, Value};
use crate::tds::error::{ConnectionResult, ValidationError};

#[derive(Debug, Clone, Copy)]
pub struct DateTime2;

impl DataType for DateTime2 {
    fn id(&self) -> u8 {
        0x2A
    }

    fn name(&self) -> &'static str {
        "DateTime2"
    }

    fn declaration(&self, parameter: &Parameter) -> String {
        format!("datetime2({})", parameter.scale().unwrap_or(7))
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
        smallvec![(temporal::time_length(scale) + 3) as u8]
    }

    fn parameter_data(&self, parameter: &Parameter, options: &EncodeOptions) -> ParameterData {
        let Some(value) = parameter.value().and_then(|v| temporal::resolve(v, options)) else {
            return ParameterData::empty();
        };
        let scale = parameter.scale().unwrap_or(7);
        let options = *options;
        ParameterData::once(move || {
            let mut buf = BytesMut::with_capacity(8);
            let time = temporal::scaled_time(temporal::nanos_of_day(&value, &options), scale);
            temporal::put_time(&mut buf, time, scale);
            temporal::put_days(&mut buf, temporal::day_count(&value, YEAR_ONE, &options));
            buf.freeze()
        })
    }

    fn validate(&self, value: Value) -> Result<Option<SqlValue>, ValidationError> {
        temporal::validate_temporal("DateTime2", value)
    }

    fn decode(&self, data: &[u8], scale: u8) -> ConnectionResult<SqlValue> {
        let (time, days) = temporal::split_time_and_days("DateTime2", data, scale, 0)?;
        let nanos = temporal::nanos_from_scaled(temporal::read_uint_le(time), scale)?;
        let days = temporal::read_uint_le(days) as i64;
        let datetime = temporal::datetime_from_parts(YEAR_ONE, days, nanos)?;
        Ok(SqlValue::DateTime(datetime.and_utc().fixed_offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tds::types::DATE_TIME2;
    use chrono::{DateTime, Datelike, NaiveDate};

    const VALUE: &str = "2021-03-04T05:06:07.1234567Z";

    #[test]
    fn test_scale_resolution() {
        assert_eq!(Parameter::new(&DATE_TIME2, VALUE).unwrap().scale(), Some(7));
        assert_eq!(Parameter::new(&DATE_TIME2, Value::Null).unwrap().scale(), Some(0));
        assert_eq!(Parameter::with_scale(&DATE_TIME2, VALUE, 3).unwrap().scale(), Some(3));
        assert_eq!(Parameter::with_scale(&DATE_TIME2, Value::Null, 4).unwrap().scale(), Some(4));
    }

    #[test]
    fn test_type_info_and_declaration() {
        let param = Parameter::with_scale(&DATE_TIME2, VALUE, 5).unwrap();
        assert_eq!(&param.type_info()[..], &[0x2A, 5]);
        assert_eq!(param.declaration(), "datetime2(5)");
    }

    #[test]
    fn test_field_widths_by_scale() {
        let options = EncodeOptions::default();
        for (scale, length) in [(0u8, 6u8), (1, 6), (2, 6), (3, 7), (4, 7), (5, 8), (6, 8), (7, 8)] {
            let param = Parameter::with_scale(&DATE_TIME2, VALUE, scale).unwrap();
            let encoded = param.encode(&options);
            assert_eq!(encoded[0], length, "scale {}", scale);
            assert_eq!(encoded.len(), length as usize + 1, "scale {}", scale);

            let null = Parameter::with_scale(&DATE_TIME2, Value::Null, scale).unwrap();
            assert_eq!(&null.encode(&options)[..], &[0]);
        }
    }

    #[test]
    fn test_time_and_day_fields() {
        let param = Parameter::with_scale(&DATE_TIME2, VALUE, 7).unwrap();
        let encoded = param.encode(&EncodeOptions::default());

        // 05:06:07.1234567 in 100ns units
        let expected_time: u64 = (5 * 3600 + 6 * 60 + 7) * 10_000_000 + 1_234_567;
        assert_eq!(temporal::read_uint_le(&encoded[1..6]), expected_time);

        let days = NaiveDate::from_ymd_opt(2021, 3, 4).unwrap().num_days_from_ce() - 1;
        assert_eq!(temporal::read_uint_le(&encoded[6..9]), days as u64);
    }

    #[test]
    fn test_scale_rounding() {
        let param = Parameter::with_scale(&DATE_TIME2, "2021-03-04T00:00:00.15Z", 1).unwrap();
        let encoded = param.encode(&EncodeOptions::default());
        assert_eq!(temporal::read_uint_le(&encoded[1..4]), 2);
    }

    #[test]
    fn test_decode_roundtrip() {
        let options = EncodeOptions::default();
        for scale in 0..=7u8 {
            let raw = "2021-03-04T05:06:07Z";
            let param = Parameter::with_scale(&DATE_TIME2, raw, scale).unwrap();
            let encoded = param.encode(&options);
            let decoded = DATE_TIME2.decode(&encoded[1..], scale).unwrap();
            assert_eq!(decoded, SqlValue::DateTime(DateTime::parse_from_rfc3339(raw).unwrap()));
        }

        let param = Parameter::new(&DATE_TIME2, VALUE).unwrap();
        let decoded = DATE_TIME2.decode(&param.encode(&options)[1..], 7).unwrap();
        assert_eq!(Some(&decoded), param.value());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        assert!(DATE_TIME2.decode(&[0; 7], 7).is_err());
    }
}
