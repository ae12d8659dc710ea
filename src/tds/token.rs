//! Token stream parser.
//!
//! A tabular result message is a flat sequence of tokens, each introduced by
//! a one-byte token type. [`TokenParser`] walks one message payload exactly
//! once, yielding tokens in wire order and `None` at the end of the stream.
//! Column metadata seen in a COLMETADATA token is kept for the ROW and
//! NBCROW tokens that follow it in the same message.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use uuid::Uuid;

use super::decoder::{encoding_for_lcid, TextDecoder};
use super::error::{codes, is_transient_error_number, ConnectionError, ConnectionResult, RequestError};
use super::protocol::utf16le_to_string;
use super::types::{DataType, SqlValue, BIG_INT, DATE, DATE_TIME, DATE_TIME2, DATE_TIME_OFFSET};

/// Token type bytes.
pub mod token_type {
    pub const RETURNSTATUS: u8 = 0x79;
    pub const COLMETADATA: u8 = 0x81;
    pub const ORDER: u8 = 0xA9;
    pub const ERROR: u8 = 0xAA;
    pub const INFO: u8 = 0xAB;
    pub const RETURNVALUE: u8 = 0xAC;
    pub const LOGINACK: u8 = 0xAD;
    pub const FEATUREEXTACK: u8 = 0xAE;
    pub const ROW: u8 = 0xD1;
    pub const NBCROW: u8 = 0xD2;
    pub const ENVCHANGE: u8 = 0xE3;
    pub const SSPI: u8 = 0xED;
    pub const FEDAUTHINFO: u8 = 0xEE;
    pub const DONE: u8 = 0xFD;
    pub const DONEPROC: u8 = 0xFE;
    pub const DONEINPROC: u8 = 0xFF;
}

/// DONE status bits.
pub mod done_status {
    pub const MORE: u16 = 0x0001;
    pub const ERROR: u16 = 0x0002;
    pub const IN_XACT: u16 = 0x0004;
    pub const COUNT: u16 = 0x0010;
    pub const ATTN: u16 = 0x0020;
    pub const SRVERROR: u16 = 0x0100;
}

mod env_type {
    pub const DATABASE: u8 = 1;
    pub const LANGUAGE: u8 = 2;
    pub const CHARSET: u8 = 3;
    pub const PACKET_SIZE: u8 = 4;
    pub const SQL_COLLATION: u8 = 7;
    pub const BEGIN_TRANSACTION: u8 = 8;
    pub const COMMIT_TRANSACTION: u8 = 9;
    pub const ROLLBACK_TRANSACTION: u8 = 10;
    pub const RESET_CONNECTION: u8 = 18;
    pub const ROUTING: u8 = 20;
}

mod fedauth_info_id {
    pub const STSURL: u8 = 0x01;
    pub const SPN: u8 = 0x02;
}

/// Column type ids that can appear in COLMETADATA.
mod column_type {
    pub const NULL: u8 = 0x1F;
    pub const GUID: u8 = 0x24;
    pub const INTN: u8 = 0x26;
    pub const DATEN: u8 = 0x28;
    pub const TIMEN: u8 = 0x29;
    pub const DATETIME2N: u8 = 0x2A;
    pub const DATETIMEOFFSETN: u8 = 0x2B;
    pub const INT1: u8 = 0x30;
    pub const BIT: u8 = 0x32;
    pub const INT2: u8 = 0x34;
    pub const INT4: u8 = 0x38;
    pub const DATETIM4: u8 = 0x3A;
    pub const FLT4: u8 = 0x3B;
    pub const MONEY: u8 = 0x3C;
    pub const DATETIME: u8 = 0x3D;
    pub const FLT8: u8 = 0x3E;
    pub const BITN: u8 = 0x68;
    pub const DECIMALN: u8 = 0x6A;
    pub const NUMERICN: u8 = 0x6C;
    pub const FLTN: u8 = 0x6D;
    pub const MONEYN: u8 = 0x6E;
    pub const DATETIMN: u8 = 0x6F;
    pub const MONEY4: u8 = 0x7A;
    pub const INT8: u8 = 0x7F;
    pub const BIGVARBIN: u8 = 0xA5;
    pub const BIGVARCHR: u8 = 0xA7;
    pub const BIGBINARY: u8 = 0xAD;
    pub const BIGCHR: u8 = 0xAF;
    pub const NVARCHAR: u8 = 0xE7;
    pub const NCHAR: u8 = 0xEF;
}

/// Marks a MAX column whose values are sent as partially length-prefixed chunks.
const PLP_MARKER: u16 = 0xFFFF;
const CHAR_NULL: u16 = 0xFFFF;

// ============================================================================
// Token types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    pub interface: u8,
    pub tds_version: u32,
    pub prog_name: String,
    /// Major, minor, build
    pub prog_version: (u8, u8, u16),
}

/// Security token service hint sent in answer to a federated LOGIN7.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FedAuthInfo {
    pub sts_url: Option<String>,
    pub spn: Option<String>,
}

/// Redirect target announced during login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingData {
    pub host: String,
    pub port: u16,
}

/// Server collation as carried by ENVCHANGE and character column metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation {
    pub lcid: u32,
    pub flags: u8,
    pub version: u8,
    pub sort_id: u8,
}

impl Collation {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != 5 {
            return None;
        }
        let info = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        Some(Self {
            lcid: info & 0x000F_FFFF,
            flags: ((info >> 20) & 0xFF) as u8,
            version: (info >> 28) as u8,
            sort_id: b[4],
        })
    }

    /// Encoding of non-Unicode text stored with this collation.
    pub fn encoding(&self) -> &'static str {
        encoding_for_lcid(self.lcid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Database { new: String, old: String },
    Language { new: String, old: String },
    Charset { new: String, old: String },
    PacketSize { new: u32, old: u32 },
    Collation(Option<Collation>),
    BeginTransaction { descriptor: u64 },
    CommitTransaction,
    RollbackTransaction,
    ResetConnection,
    Routing(RoutingData),
    /// A change type this client does not act on
    Other(u8),
}

/// Body of an ERROR or INFO token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub message: String,
    pub server_name: String,
    pub proc_name: String,
    pub line_number: u32,
}

impl ServerMessage {
    pub fn is_transient(&self) -> bool {
        is_transient_error_number(self.number)
    }

    /// Login failure carrying this server message, transient for the retryable error numbers.
    pub fn to_login_error(&self) -> ConnectionError {
        ConnectionError::authentication(codes::ELOGIN, self.message.clone()).with_transient(self.is_transient())
    }
}

impl From<ServerMessage> for RequestError {
    fn from(msg: ServerMessage) -> Self {
        let mut err = RequestError::new(codes::EREQUEST, msg.message);
        err.number = Some(msg.number);
        err.state = Some(msg.state);
        err.class = Some(msg.class);
        err.server_name = Some(msg.server_name).filter(|s| !s.is_empty());
        err.proc_name = Some(msg.proc_name).filter(|s| !s.is_empty());
        err.line_number = Some(msg.line_number);
        err
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub status: u16,
    pub cur_cmd: u16,
    pub row_count: u64,
}

impl Done {
    pub fn has_more(&self) -> bool {
        self.status & done_status::MORE != 0
    }

    pub fn is_error(&self) -> bool {
        self.status & (done_status::ERROR | done_status::SRVERROR) != 0
    }

    pub fn is_attention_ack(&self) -> bool {
        self.status & done_status::ATTN != 0
    }

    /// Affected row count, when the server reported one.
    pub fn row_count(&self) -> Option<u64> {
        (self.status & done_status::COUNT != 0).then_some(self.row_count)
    }

    /// Whether `payload` ends in a DONE token acknowledging an attention.
    ///
    /// Looks at the trailing bytes only, so it works on streams the parser rejects.
    pub fn trails_attention_ack(payload: &[u8]) -> bool {
        let Some(start) = payload.len().checked_sub(DONE_TOKEN_LEN) else {
            return false;
        };
        let tail = &payload[start..];
        let status = u16::from_le_bytes([tail[1], tail[2]]);
        matches!(tail[0], token_type::DONE | token_type::DONEPROC | token_type::DONEINPROC)
            && status & done_status::ATTN != 0
    }
}

/// Token byte, status, current command and row count.
const DONE_TOKEN_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    pub feature_id: u8,
    pub data: Bytes,
}

/// How a column value's length is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLength {
    Fixed(usize),
    /// One-byte length, zero means NULL
    Byte,
    /// Two-byte length, 0xFFFF means NULL
    UShort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub type_id: u8,
    pub length: ValueLength,
    pub max_length: usize,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub collation: Option<Collation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub user_type: u32,
    pub flags: u16,
    pub type_info: TypeInfo,
}

/// Column metadata shared between a COLMETADATA token and the rows it describes.
pub type SharedColumns = Arc<Vec<ColumnMetadata>>;

/// A decoded column or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Bit(bool),
    Float(f64),
    Text(String),
    Binary(Bytes),
    Guid(Uuid),
    /// A value decoded by the data type registry
    Typed(SqlValue),
    /// Bytes of a type this client carries but does not interpret
    Raw(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    pub ordinal: u16,
    pub name: String,
    pub value: ColumnValue,
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LoginAck(LoginAck),
    FedAuthInfo(FedAuthInfo),
    EnvChange(EnvChange),
    Error(ServerMessage),
    Info(ServerMessage),
    Done(Done),
    DoneProc(Done),
    DoneInProc(Done),
    FeatureExtAck(Vec<FeatureAck>),
    /// SSPI payload; during NTLM login this is the server challenge
    Sspi(Bytes),
    ColMetadata(SharedColumns),
    Row(Vec<ColumnValue>),
    ReturnStatus(i32),
    ReturnValue(ReturnValue),
    Order(Vec<u16>),
}

impl Token {
    /// The DONE payload of any of the three DONE variants.
    pub fn as_done(&self) -> Option<&Done> {
        match self {
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => Some(done),
            _ => None,
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Bounds-checked little-endian reader over a token payload.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, n: usize) -> ConnectionResult<()> {
        if self.buf.len() < n {
            return Err(ConnectionError::protocol(format!(
                "Unexpected end of token stream: needed {} bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> ConnectionResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> ConnectionResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> ConnectionResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u32_be(&mut self) -> ConnectionResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> ConnectionResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> ConnectionResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn take(&mut self, n: usize) -> ConnectionResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Length-prefixed sub-reader (u16 length)
    fn sub_u16(&mut self) -> ConnectionResult<Reader> {
        let len = self.u16()? as usize;
        Ok(Reader::new(self.take(len)?))
    }

    fn b_varchar(&mut self) -> ConnectionResult<String> {
        let chars = self.u8()? as usize;
        Ok(utf16le_to_string(&self.take(chars * 2)?))
    }

    fn us_varchar(&mut self) -> ConnectionResult<String> {
        let chars = self.u16()? as usize;
        Ok(utf16le_to_string(&self.take(chars * 2)?))
    }

    fn b_varbyte(&mut self) -> ConnectionResult<Bytes> {
        let len = self.u8()? as usize;
        self.take(len)
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Single-pass parser over one message payload.
pub struct TokenParser {
    reader: Reader,
    columns: SharedColumns,
    decoder: Arc<dyn TextDecoder>,
    failed: bool,
}

impl fmt::Debug for TokenParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenParser")
            .field("remaining", &self.reader.buf.len())
            .field("columns", &self.columns.len())
            .finish()
    }
}

impl TokenParser {
    pub fn new(payload: Bytes, decoder: Arc<dyn TextDecoder>) -> Self {
        Self {
            reader: Reader::new(payload),
            columns: Arc::new(Vec::new()),
            decoder,
            failed: false,
        }
    }

    /// Next token in wire order, or `None` at the end of the message.
    pub fn next_token(&mut self) -> ConnectionResult<Option<Token>> {
        if self.failed || self.reader.is_empty() {
            return Ok(None);
        }
        let result = self.read_token();
        if result.is_err() {
            self.failed = true;
        }
        result.map(Some)
    }

    fn read_token(&mut self) -> ConnectionResult<Token> {
        let token_type = self.reader.u8()?;
        let token = match token_type {
            token_type::LOGINACK => Token::LoginAck(self.login_ack()?),
            token_type::ENVCHANGE => Token::EnvChange(self.env_change()?),
            token_type::ERROR => Token::Error(self.server_message()?),
            token_type::INFO => Token::Info(self.server_message()?),
            token_type::DONE => Token::Done(self.done()?),
            token_type::DONEPROC => Token::DoneProc(self.done()?),
            token_type::DONEINPROC => Token::DoneInProc(self.done()?),
            token_type::FEDAUTHINFO => Token::FedAuthInfo(self.fed_auth_info()?),
            token_type::FEATUREEXTACK => Token::FeatureExtAck(self.feature_ext_ack()?),
            token_type::SSPI => {
                let len = self.reader.u16()? as usize;
                Token::Sspi(self.reader.take(len)?)
            }
            token_type::COLMETADATA => Token::ColMetadata(self.col_metadata()?),
            token_type::ROW => Token::Row(self.row()?),
            token_type::NBCROW => Token::Row(self.nbc_row()?),
            token_type::RETURNSTATUS => Token::ReturnStatus(self.reader.i32()?),
            token_type::RETURNVALUE => Token::ReturnValue(self.return_value()?),
            token_type::ORDER => {
                let mut body = self.reader.sub_u16()?;
                let mut columns = Vec::new();
                while !body.is_empty() {
                    columns.push(body.u16()?);
                }
                Token::Order(columns)
            }
            other => {
                return Err(ConnectionError::protocol(format!("Unknown token type 0x{:02x}", other)));
            }
        };
        trace!("Parsed token 0x{:02x}", token_type);
        Ok(token)
    }

    fn login_ack(&mut self) -> ConnectionResult<LoginAck> {
        let mut body = self.reader.sub_u16()?;
        let interface = body.u8()?;
        let tds_version = body.u32_be()?;
        let prog_name = body.b_varchar()?;
        let major = body.u8()?;
        let minor = body.u8()?;
        let build_hi = body.u8()?;
        let build_lo = body.u8()?;
        Ok(LoginAck {
            interface,
            tds_version,
            prog_name,
            prog_version: (major, minor, u16::from_be_bytes([build_hi, build_lo])),
        })
    }

    fn env_change(&mut self) -> ConnectionResult<EnvChange> {
        let mut body = self.reader.sub_u16()?;
        let change = match body.u8()? {
            env_type::DATABASE => EnvChange::Database {
                new: body.b_varchar()?,
                old: body.b_varchar()?,
            },
            env_type::LANGUAGE => EnvChange::Language {
                new: body.b_varchar()?,
                old: body.b_varchar()?,
            },
            env_type::CHARSET => EnvChange::Charset {
                new: body.b_varchar()?,
                old: body.b_varchar()?,
            },
            env_type::PACKET_SIZE => {
                let parse = |s: String| {
                    s.parse::<u32>()
                        .map_err(|_| ConnectionError::protocol(format!("Invalid packet size: {:?}", s)))
                };
                let new = parse(body.b_varchar()?)?;
                // The old value is empty on some servers
                let old = parse(body.b_varchar()?).unwrap_or(0);
                EnvChange::PacketSize { new, old }
            }
            env_type::SQL_COLLATION => EnvChange::Collation(Collation::from_bytes(&body.b_varbyte()?)),
            env_type::BEGIN_TRANSACTION => {
                let new = body.b_varbyte()?;
                let descriptor = <[u8; 8]>::try_from(&new[..])
                    .map_err(|_| ConnectionError::protocol("Invalid transaction descriptor length"))?;
                EnvChange::BeginTransaction {
                    descriptor: u64::from_le_bytes(descriptor),
                }
            }
            env_type::COMMIT_TRANSACTION => EnvChange::CommitTransaction,
            env_type::ROLLBACK_TRANSACTION => EnvChange::RollbackTransaction,
            env_type::RESET_CONNECTION => EnvChange::ResetConnection,
            env_type::ROUTING => {
                let mut value = body.sub_u16()?;
                let protocol = value.u8()?;
                if protocol != 0 {
                    return Err(ConnectionError::protocol(format!(
                        "Unsupported routing protocol {}",
                        protocol
                    )));
                }
                let port = value.u16()?;
                let host = value.us_varchar()?;
                EnvChange::Routing(RoutingData { host, port })
            }
            other => EnvChange::Other(other),
        };
        Ok(change)
    }

    fn server_message(&mut self) -> ConnectionResult<ServerMessage> {
        let mut body = self.reader.sub_u16()?;
        Ok(ServerMessage {
            number: body.i32()?,
            state: body.u8()?,
            class: body.u8()?,
            message: body.us_varchar()?,
            server_name: body.b_varchar()?,
            proc_name: body.b_varchar()?,
            line_number: body.u32()?,
        })
    }

    fn done(&mut self) -> ConnectionResult<Done> {
        Ok(Done {
            status: self.reader.u16()?,
            cur_cmd: self.reader.u16()?,
            row_count: self.reader.u64()?,
        })
    }

    fn fed_auth_info(&mut self) -> ConnectionResult<FedAuthInfo> {
        let len = self.reader.u32()? as usize;
        let data = self.reader.take(len)?;
        let mut body = Reader::new(data.clone());

        let mut info = FedAuthInfo::default();
        let count = body.u32()?;
        for _ in 0..count {
            let id = body.u8()?;
            let data_len = body.u32()? as usize;
            // Offsets count from the start of the id count field
            let offset = body.u32()? as usize;
            let value = data
                .get(offset..offset.saturating_add(data_len))
                .ok_or_else(|| ConnectionError::protocol("FEDAUTHINFO option out of bounds"))?;
            match id {
                fedauth_info_id::STSURL => info.sts_url = Some(utf16le_to_string(value)),
                fedauth_info_id::SPN => info.spn = Some(utf16le_to_string(value)),
                _ => {}
            }
        }
        Ok(info)
    }

    fn feature_ext_ack(&mut self) -> ConnectionResult<Vec<FeatureAck>> {
        let mut acks = Vec::new();
        loop {
            let feature_id = self.reader.u8()?;
            if feature_id == 0xFF {
                return Ok(acks);
            }
            let len = self.reader.u32()? as usize;
            acks.push(FeatureAck {
                feature_id,
                data: self.reader.take(len)?,
            });
        }
    }

    fn col_metadata(&mut self) -> ConnectionResult<SharedColumns> {
        let count = self.reader.u16()?;
        let mut columns = Vec::new();
        // 0xFFFF: no metadata follows
        if count != 0xFFFF {
            columns.reserve(count as usize);
            for _ in 0..count {
                let user_type = self.reader.u32()?;
                let flags = self.reader.u16()?;
                let type_info = read_type_info(&mut self.reader)?;
                let name = self.reader.b_varchar()?;
                columns.push(ColumnMetadata {
                    name,
                    user_type,
                    flags,
                    type_info,
                });
            }
        }
        self.columns = Arc::new(columns);
        Ok(Arc::clone(&self.columns))
    }

    fn row(&mut self) -> ConnectionResult<Vec<ColumnValue>> {
        let columns = Arc::clone(&self.columns);
        columns
            .iter()
            .map(|column| read_value(&mut self.reader, &column.type_info, self.decoder.as_ref()))
            .collect()
    }

    fn nbc_row(&mut self) -> ConnectionResult<Vec<ColumnValue>> {
        let columns = Arc::clone(&self.columns);
        let bitmap = self.reader.take(columns.len().div_ceil(8))?;
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(ColumnValue::Null);
            } else {
                values.push(read_value(&mut self.reader, &column.type_info, self.decoder.as_ref())?);
            }
        }
        Ok(values)
    }

    fn return_value(&mut self) -> ConnectionResult<ReturnValue> {
        let ordinal = self.reader.u16()?;
        let name = self.reader.b_varchar()?;
        let _status = self.reader.u8()?;
        let _user_type = self.reader.u32()?;
        let _flags = self.reader.u16()?;
        let type_info = read_type_info(&mut self.reader)?;
        let value = read_value(&mut self.reader, &type_info, self.decoder.as_ref())?;
        Ok(ReturnValue { ordinal, name, value })
    }
}

impl Iterator for TokenParser {
    type Item = ConnectionResult<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

fn unsupported(type_id: u8, what: &str) -> ConnectionError {
    ConnectionError::protocol(format!("Column type 0x{:02x}: {} not supported", type_id, what))
}

fn read_type_info(r: &mut Reader) -> ConnectionResult<TypeInfo> {
    use column_type::*;

    let type_id = r.u8()?;
    let mut info = TypeInfo {
        type_id,
        length: ValueLength::Fixed(0),
        max_length: 0,
        precision: None,
        scale: None,
        collation: None,
    };
    match type_id {
        NULL => {}
        INT1 | BIT => info.length = ValueLength::Fixed(1),
        INT2 => info.length = ValueLength::Fixed(2),
        INT4 | DATETIM4 | FLT4 | MONEY4 => info.length = ValueLength::Fixed(4),
        INT8 | DATETIME | FLT8 | MONEY => info.length = ValueLength::Fixed(8),
        GUID | INTN | BITN | FLTN | MONEYN | DATETIMN => {
            info.max_length = r.u8()? as usize;
            info.length = ValueLength::Byte;
        }
        DATEN => info.length = ValueLength::Byte,
        TIMEN | DATETIME2N | DATETIMEOFFSETN => {
            info.scale = Some(r.u8()?);
            info.length = ValueLength::Byte;
        }
        DECIMALN | NUMERICN => {
            info.max_length = r.u8()? as usize;
            info.precision = Some(r.u8()?);
            info.scale = Some(r.u8()?);
            info.length = ValueLength::Byte;
        }
        BIGVARCHR | BIGCHR | NVARCHAR | NCHAR | BIGVARBIN | BIGBINARY => {
            let max_length = r.u16()?;
            if max_length == PLP_MARKER {
                return Err(unsupported(type_id, "MAX length values are"));
            }
            info.max_length = max_length as usize;
            if !matches!(type_id, BIGVARBIN | BIGBINARY) {
                info.collation = Collation::from_bytes(&r.take(5)?);
            }
            info.length = ValueLength::UShort;
        }
        other => return Err(unsupported(other, "type is")),
    }
    Ok(info)
}

fn read_value(r: &mut Reader, info: &TypeInfo, decoder: &dyn TextDecoder) -> ConnectionResult<ColumnValue> {
    let data = match info.length {
        ValueLength::Fixed(0) => return Ok(ColumnValue::Null),
        ValueLength::Fixed(n) => r.take(n)?,
        ValueLength::Byte => match r.u8()? {
            0 => return Ok(ColumnValue::Null),
            n => r.take(n as usize)?,
        },
        ValueLength::UShort => match r.u16()? {
            CHAR_NULL => return Ok(ColumnValue::Null),
            n => r.take(n as usize)?,
        },
    };
    convert_value(info, data, decoder)
}

fn convert_value(info: &TypeInfo, data: Bytes, decoder: &dyn TextDecoder) -> ConnectionResult<ColumnValue> {
    use column_type::*;

    let scale = info.scale.unwrap_or(7);
    let value = match info.type_id {
        INT8 => ColumnValue::Typed(BIG_INT.decode(&data, 0)?),
        INT1 | INT2 | INT4 | INTN => match data.len() {
            1 => ColumnValue::Int(data[0] as i64),
            2 => ColumnValue::Int(i16::from_le_bytes([data[0], data[1]]) as i64),
            4 => ColumnValue::Int(i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64),
            8 => ColumnValue::Typed(BIG_INT.decode(&data, 0)?),
            n => return Err(ConnectionError::protocol(format!("Invalid integer length {}", n))),
        },
        BIT | BITN => ColumnValue::Bit(data[0] != 0),
        FLT4 | FLT8 | FLTN => match data.len() {
            4 => ColumnValue::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64),
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&data);
                ColumnValue::Float(f64::from_le_bytes(b))
            }
            n => return Err(ConnectionError::protocol(format!("Invalid float length {}", n))),
        },
        DATETIME | DATETIM4 | DATETIMN => ColumnValue::Typed(DATE_TIME.decode(&data, 0)?),
        DATEN => ColumnValue::Typed(DATE.decode(&data, 0)?),
        DATETIME2N => ColumnValue::Typed(DATE_TIME2.decode(&data, scale)?),
        DATETIMEOFFSETN => ColumnValue::Typed(DATE_TIME_OFFSET.decode(&data, scale)?),
        GUID => {
            let bytes = <[u8; 16]>::try_from(&data[..])
                .map_err(|_| ConnectionError::protocol(format!("Invalid GUID length {}", data.len())))?;
            ColumnValue::Guid(Uuid::from_bytes_le(bytes))
        }
        BIGVARCHR | BIGCHR => {
            let encoding = info.collation.map_or("CP1252", |c| c.encoding());
            ColumnValue::Text(decoder.decode(&data, encoding))
        }
        NVARCHAR | NCHAR => ColumnValue::Text(decoder.decode(&data, "ucs2")),
        BIGVARBIN | BIGBINARY => ColumnValue::Binary(data),
        _ => ColumnValue::Raw(data),
    };
    Ok(value)
}
