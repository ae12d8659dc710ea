//! `date`: days since 0001-01-01 in three little-endian bytes.

use bytes::BytesMut;
use smallvec::smallvec;

use super::temporal::{self, YEAR_ONE};
use super::{DataType, EncodeOptions, Parameter, ParameterData, SmallBytes, SqlValue, Value};
use crate::tds::error::{ConnectionError, ConnectionResult, ValidationError};

#[derive(Debug, Clone, Copy)]
pub struct Date;

impl DataType for Date {
    fn id(&self) -> u8 {
        0x28
    }

    fn name(&self) -> &'static str {
        "Date"
    }

    fn declaration(&self, _parameter: &Parameter) -> String {
        "date".to_string()
    }

    fn type_info(&self, _parameter: &Parameter) -> SmallBytes {
        smallvec![self.id()]
    }

    fn parameter_length(&self, parameter: &Parameter, _options: &EncodeOptions) -> SmallBytes {
        if parameter.is_null() {
            smallvec![0]
        } else {
            smallvec![3]
        }
    }

    fn parameter_data(&self, parameter: &Parameter, options: &EncodeOptions) -> ParameterData {
        let Some(value) = parameter.value().and_then(|v| temporal::resolve(v, options)) else {
            return ParameterData::empty();
        };
        let options = *options;
        ParameterData::once(move || {
            let mut buf = BytesMut::with_capacity(3);
            temporal::put_days(&mut buf, temporal::day_count(&value, YEAR_ONE, &options));
            buf.freeze()
        })
    }

    fn validate(&self, value: Value) -> Result<Option<SqlValue>, ValidationError> {
        temporal::validate_temporal("Date", value)
    }

    fn decode(&self, data: &[u8], _scale: u8) -> ConnectionResult<SqlValue> {
        if data.len() != 3 {
            return Err(ConnectionError::protocol(format!("Invalid Date length: {}", data.len())));
        }
        let days = temporal::read_uint_le(data) as i64;
        let datetime = temporal::datetime_from_parts(YEAR_ONE, days, 0)?;
        Ok(SqlValue::DateTime(datetime.and_utc().fixed_offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tds::types::{LocalTimeZone, DATE};
    use chrono::{DateTime, Datelike, FixedOffset, NaiveDate};

    fn days_field(date: NaiveDate) -> [u8; 3] {
        let days = (date.num_days_from_ce() - 1) as u32;
        let b = days.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    #[test]
    fn test_encode_utc() {
        let param = Parameter::new(&DATE, "2015-06-18T23:59:59Z").unwrap();
        let encoded = param.encode(&EncodeOptions::default());

        let mut expected = vec![3];
        expected.extend_from_slice(&days_field(NaiveDate::from_ymd_opt(2015, 6, 18).unwrap()));
        assert_eq!(&encoded[..], &expected[..]);
        assert_eq!(&param.type_info()[..], &[0x28]);
        assert_eq!(param.declaration(), "date");
    }

    #[test]
    fn test_epoch_encodes_as_zero() {
        let param = Parameter::new(&DATE, NaiveDate::from_ymd_opt(1, 1, 1).unwrap()).unwrap();
        assert_eq!(&param.encode(&EncodeOptions::default())[..], &[3, 0, 0, 0]);
    }

    #[test]
    fn test_utc_encoding_is_deterministic() {
        let param = Parameter::new(&DATE, "2024-02-29 12:00:00").unwrap();
        let options = EncodeOptions::default();
        assert_eq!(param.encode(&options), param.encode(&options));
    }

    #[test]
    fn test_local_mode_uses_local_calendar_day() {
        let options = EncodeOptions {
            use_utc: false,
            time_zone: LocalTimeZone::Fixed(FixedOffset::west_opt(5 * 3600).unwrap()),
        };
        // 02:00 UTC is still the previous evening at -05:00
        let param = Parameter::new(&DATE, "2015-06-18T02:00:00Z").unwrap();
        let encoded = param.encode(&options);
        assert_eq!(&encoded[1..], &days_field(NaiveDate::from_ymd_opt(2015, 6, 17).unwrap()));

        let utc = param.encode(&EncodeOptions::default());
        assert_eq!(&utc[1..], &days_field(NaiveDate::from_ymd_opt(2015, 6, 18).unwrap()));
    }

    #[test]
    fn test_naive_date_keeps_its_calendar_day_in_local_mode() {
        let options = EncodeOptions {
            use_utc: false,
            time_zone: LocalTimeZone::Fixed(FixedOffset::west_opt(5 * 3600).unwrap()),
        };
        let expected = days_field(NaiveDate::from_ymd_opt(2015, 6, 18).unwrap());

        let param = Parameter::new(&DATE, "2015-06-18").unwrap();
        assert_eq!(&param.encode(&options)[1..], &expected);
        assert_eq!(&param.encode(&EncodeOptions::default())[1..], &expected);

        let param = Parameter::new(&DATE, NaiveDate::from_ymd_opt(2015, 6, 18).unwrap()).unwrap();
        assert_eq!(&param.encode(&options)[1..], &expected);

        let east = EncodeOptions {
            use_utc: false,
            time_zone: LocalTimeZone::Fixed(FixedOffset::east_opt(9 * 3600).unwrap()),
        };
        assert_eq!(&param.encode(&east)[1..], &expected);
    }

    #[test]
    fn test_decode() {
        let field = days_field(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap());
        let value = DATE.decode(&field, 0).unwrap();
        let expected = DateTime::parse_from_rfc3339("1999-12-31T00:00:00Z").unwrap();
        assert_eq!(value, SqlValue::DateTime(expected));
    }
}
