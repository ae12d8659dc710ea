//! Data type codecs for RPC parameters and result columns.
//!
//! Every registered type is a process-wide, stateless singleton implementing
//! [`DataType`]. Values only reach the encoders through [`Parameter::new`],
//! which runs the type's `validate` and `resolve_scale` first.
//!
//! Wire layout of an encoded parameter value: the length prefix produced by
//! `parameter_length` followed by the chunks yielded by `parameter_data`. A
//! zero length prefix with no data means SQL NULL.

mod bigint;
mod date;
mod datetime;
mod datetime2;
mod datetimeoffset;
mod temporal;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use smallvec::SmallVec;

use super::error::{ConnectionResult, ValidationError};
use super::protocol::put_b_varchar;

pub use bigint::BigInt;
pub use date::Date;
pub use datetime::DateTime as DateTimeType;
pub use datetime2::DateTime2;
pub use datetimeoffset::DateTimeOffset;
pub use temporal::{EncodeOptions, LocalTimeZone};

/// Inline storage for type info and length prefixes (never more than a few bytes).
pub type SmallBytes = SmallVec<[u8; 4]>;

// ============================================================================
// Values
// ============================================================================

/// Raw input accepted by `validate`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    /// Wide integer, range-checked by integral types.
    Wide(i128),
    Float(f64),
    Text(String),
    DateTime(DateTime<FixedOffset>),
    NaiveDateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Value::Wide(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v.fixed_offset())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::NaiveDateTime(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Canonical value produced by `validate` and by `decode`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    BigInt(i64),
    DateTime(DateTime<FixedOffset>),
    /// Wall-clock time without an offset; the zone is chosen when encoding.
    NaiveDateTime(NaiveDateTime),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            SqlValue::DateTime(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_naive_datetime(&self) -> Option<&NaiveDateTime> {
        match self {
            SqlValue::NaiveDateTime(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Data type trait
// ============================================================================

/// Codec for a single SQL type.
pub trait DataType: Send + Sync + fmt::Debug {
    /// Type id as listed in the registry.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// SQL declaration used in parameter lists, e.g. `datetime2(7)`.
    fn declaration(&self, parameter: &Parameter) -> String;

    /// Effective fractional-second scale; only variable-precision types have one.
    ///
    /// `parameter.scale()` holds the explicitly requested scale at this point.
    fn resolve_scale(&self, _parameter: &Parameter) -> Option<u8> {
        None
    }

    fn type_info(&self, parameter: &Parameter) -> SmallBytes;

    /// Length prefix; a zero length denotes NULL.
    fn parameter_length(&self, parameter: &Parameter, options: &EncodeOptions) -> SmallBytes;

    /// Encoded value bytes; yields nothing for NULL.
    fn parameter_data(&self, parameter: &Parameter, options: &EncodeOptions) -> ParameterData;

    /// Normalize raw input into the canonical value, or `None` for NULL.
    fn validate(&self, value: Value) -> Result<Option<SqlValue>, ValidationError>;

    /// Decode a non-null value received in a ROW token.
    fn decode(&self, data: &[u8], scale: u8) -> ConnectionResult<SqlValue>;
}

/// Lazy, finite, single-pass sequence of encoded byte chunks.
///
/// Encoding happens only when the first chunk is pulled.
pub struct ParameterData {
    pending: Option<Box<dyn FnOnce() -> Bytes + Send>>,
}

impl ParameterData {
    pub fn empty() -> Self {
        Self { pending: None }
    }

    pub fn once<F>(produce: F) -> Self
    where
        F: FnOnce() -> Bytes + Send + 'static,
    {
        Self {
            pending: Some(Box::new(produce)),
        }
    }
}

impl Iterator for ParameterData {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.pending.take().map(|produce| produce())
    }
}

impl fmt::Debug for ParameterData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterData")
            .field("exhausted", &self.pending.is_none())
            .finish()
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A validated parameter value bound to its data type.
#[derive(Debug, Clone)]
pub struct Parameter {
    data_type: &'static dyn DataType,
    name: String,
    value: Option<SqlValue>,
    scale: Option<u8>,
    precision: Option<u8>,
    output: bool,
}

impl Parameter {
    /// Validate `raw` for `data_type`, resolving the default scale.
    pub fn new(data_type: &'static dyn DataType, raw: impl Into<Value>) -> Result<Self, ValidationError> {
        Self::build(data_type, raw.into(), None)
    }

    /// Validate `raw` with an explicit fractional-second scale (0-7).
    pub fn with_scale(
        data_type: &'static dyn DataType,
        raw: impl Into<Value>,
        scale: u8,
    ) -> Result<Self, ValidationError> {
        Self::build(data_type, raw.into(), Some(scale))
    }

    fn build(data_type: &'static dyn DataType, raw: Value, scale: Option<u8>) -> Result<Self, ValidationError> {
        if let Some(scale) = scale {
            if scale > 7 {
                return Err(ValidationError::new(
                    data_type.name(),
                    format!("Scale must be between 0 and 7, got {}.", scale),
                ));
            }
        }
        let value = data_type.validate(raw)?;
        let mut parameter = Self {
            data_type,
            name: String::new(),
            value,
            scale,
            precision: None,
            output: false,
        };
        parameter.scale = data_type.resolve_scale(&parameter);
        Ok(parameter)
    }

    /// Name used in RPC calls, e.g. `@id`.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn output(mut self) -> Self {
        self.output = true;
        self
    }

    pub fn data_type(&self) -> &'static dyn DataType {
        self.data_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&SqlValue> {
        self.value.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn scale(&self) -> Option<u8> {
        self.scale
    }

    pub fn precision(&self) -> Option<u8> {
        self.precision
    }

    pub fn declaration(&self) -> String {
        self.data_type.declaration(self)
    }

    pub fn type_info(&self) -> SmallBytes {
        self.data_type.type_info(self)
    }

    /// Length prefix followed by the value bytes.
    pub fn encode(&self, options: &EncodeOptions) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        self.encode_value(&mut buf, options);
        buf
    }

    fn encode_value(&self, buf: &mut BytesMut, options: &EncodeOptions) {
        buf.put_slice(&self.data_type.parameter_length(self, options));
        for chunk in self.data_type.parameter_data(self, options) {
            buf.put_slice(&chunk);
        }
    }

    /// Parameter entry of an RPC request: name, status flags, TYPE_INFO, value.
    pub fn encode_rpc(&self, buf: &mut BytesMut, options: &EncodeOptions) {
        put_b_varchar(buf, &self.name);
        buf.put_u8(if self.output { 0x01 } else { 0x00 });
        buf.put_slice(&self.type_info());
        self.encode_value(buf, options);
    }
}

// ============================================================================
// Registry
// ============================================================================

pub static BIG_INT: BigInt = BigInt;
pub static DATE: Date = Date;
pub static DATE_TIME: DateTimeType = DateTimeType;
pub static DATE_TIME2: DateTime2 = DateTime2;
pub static DATE_TIME_OFFSET: DateTimeOffset = DateTimeOffset;

static REGISTRY: [&(dyn DataType); 5] = [&BIG_INT, &DATE, &DATE_TIME, &DATE_TIME2, &DATE_TIME_OFFSET];

/// Look up a data type by its registry id.
pub fn data_type_by_id(id: u8) -> Option<&'static dyn DataType> {
    REGISTRY.iter().copied().find(|t| t.id() == id)
}

/// Look up a data type by name, case-insensitively.
pub fn data_type_by_name(name: &str) -> Option<&'static dyn DataType> {
    REGISTRY
        .iter()
        .copied()
        .find(|t| t.name().eq_ignore_ascii_case(name))
}
