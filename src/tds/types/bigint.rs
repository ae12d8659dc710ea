//! `bigint`: signed 64-bit integer, sent as a nullable INTN(8).

use bytes::Bytes;
use smallvec::smallvec;

use super::{DataType, EncodeOptions, Parameter, ParameterData, SmallBytes, SqlValue, Value};
use crate::tds::error::{ConnectionError, ConnectionResult, ValidationError};

/// Type id of the nullable integer family used on the wire.
const INTN: u8 = 0x26;

const DATA_LENGTH: u8 = 0x08;
const NULL_LENGTH: u8 = 0x00;

#[derive(Debug, Clone, Copy)]
pub struct BigInt;

impl BigInt {
    fn out_of_range() -> ValidationError {
        ValidationError::new(
            "BigInt",
            "Value must be between -9223372036854775808 and 9223372036854775807, inclusive.",
        )
    }

    fn invalid() -> ValidationError {
        ValidationError::new("BigInt", "Invalid number.")
    }

    fn check_range(value: i128) -> Result<i64, ValidationError> {
        i64::try_from(value).map_err(|_| Self::out_of_range())
    }
}

impl DataType for BigInt {
    fn id(&self) -> u8 {
        0x7F
    }

    fn name(&self) -> &'static str {
        "BigInt"
    }

    fn declaration(&self, _parameter: &Parameter) -> String {
        "bigint".to_string()
    }

    fn type_info(&self, _parameter: &Parameter) -> SmallBytes {
        smallvec![INTN, DATA_LENGTH]
    }

    fn parameter_length(&self, parameter: &Parameter, _options: &EncodeOptions) -> SmallBytes {
        if parameter.is_null() {
            smallvec![NULL_LENGTH]
        } else {
            smallvec![DATA_LENGTH]
        }
    }

    fn parameter_data(&self, parameter: &Parameter, _options: &EncodeOptions) -> ParameterData {
        match parameter.value().and_then(SqlValue::as_i64) {
            Some(v) => ParameterData::once(move || Bytes::copy_from_slice(&v.to_le_bytes())),
            None => ParameterData::empty(),
        }
    }

    fn validate(&self, value: Value) -> Result<Option<SqlValue>, ValidationError> {
        let v = match value {
            Value::Null => return Ok(None),
            Value::Int(v) => v,
            Value::Wide(v) => Self::check_range(v)?,
            Value::Float(f) => {
                if !f.is_finite() || f.fract() != 0.0 {
                    return Err(Self::invalid());
                }
                // 2^63 is the first float past i64::MAX
                if f < -9_223_372_036_854_775_808.0 || f >= 9_223_372_036_854_775_808.0 {
                    return Err(Self::out_of_range());
                }
                f as i64
            }
            Value::Text(s) => {
                let parsed = s.trim().parse::<i128>().map_err(|_| Self::invalid())?;
                Self::check_range(parsed)?
            }
            Value::DateTime(_) | Value::NaiveDateTime(_) | Value::Date(_) => {
                return Err(Self::invalid());
            }
        };
        Ok(Some(SqlValue::BigInt(v)))
    }

    fn decode(&self, data: &[u8], _scale: u8) -> ConnectionResult<SqlValue> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| ConnectionError::protocol(format!("Invalid BigInt length: {}", data.len())))?;
        Ok(SqlValue::BigInt(i64::from_le_bytes(bytes)))
    }
}
