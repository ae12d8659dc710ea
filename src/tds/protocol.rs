//! TDS wire protocol packet and message encoding.
//!
//! This module implements the client-side messages of TDS 7.4:
//! - the 8-byte packet header
//! - PRELOGIN negotiation (request encoding, response decoding)
//! - LOGIN7 with the feature extension block
//! - SQL batch, RPC, federated-auth token, SSPI and attention messages
//!
//! Reference: [MS-TDS] Tabular Data Stream Protocol.

use bytes::{Buf, BufMut, BytesMut};

use super::error::{ConnectionError, ConnectionResult};
use super::types::{EncodeOptions, Parameter};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Size of every packet header.
pub const HEADER_SIZE: usize = 8;

/// Packet size used until the server negotiates another one.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Bounds accepted for the `packetSize` option.
pub const MIN_PACKET_SIZE: usize = 512;
pub const MAX_PACKET_SIZE: usize = 32767;

/// TDS 7.4, as sent in LOGIN7 and acknowledged in LOGINACK.
pub const TDS_VERSION_7_4: u32 = 0x7400_0004;

/// Client version advertised in PRELOGIN (major, minor, build, sub-build).
const CLIENT_VERSION: (u8, u8, u16, u16) = (0, 1, 0, 0);

/// Message types carried in the first header byte.
pub mod packet_type {
    pub const SQL_BATCH: u8 = 0x01;
    pub const RPC_REQUEST: u8 = 0x03;
    pub const TABULAR_RESULT: u8 = 0x04;
    pub const ATTENTION: u8 = 0x06;
    pub const FEDAUTH_TOKEN: u8 = 0x08;
    pub const LOGIN7: u8 = 0x10;
    pub const NTLM_AUTH: u8 = 0x11;
    pub const PRELOGIN: u8 = 0x12;
}

/// Packet status bits.
pub mod packet_status {
    pub const NORMAL: u8 = 0x00;
    pub const END_OF_MESSAGE: u8 = 0x01;
    pub const IGNORE: u8 = 0x02;
    pub const RESET_CONNECTION: u8 = 0x08;
}

/// PRELOGIN option tokens.
pub mod prelogin_option {
    pub const VERSION: u8 = 0x00;
    pub const ENCRYPTION: u8 = 0x01;
    pub const INSTOPT: u8 = 0x02;
    pub const THREADID: u8 = 0x03;
    pub const MARS: u8 = 0x04;
    pub const TRACEID: u8 = 0x05;
    pub const FEDAUTHREQUIRED: u8 = 0x06;
    pub const TERMINATOR: u8 = 0xFF;
}

/// LOGIN7 flag bits.
pub mod login_flags {
    pub const USE_DB_ON: u8 = 0x20;
    pub const INIT_DB_FATAL: u8 = 0x40;
    pub const SET_LANG_ON: u8 = 0x80;

    pub const INIT_LANG_FATAL: u8 = 0x01;
    pub const ODBC_ON: u8 = 0x02;
    pub const INTEGRATED_SECURITY_ON: u8 = 0x80;

    pub const UNKNOWN_COLLATION_HANDLING: u8 = 0x08;
    pub const EXTENSION_USED: u8 = 0x10;
}

/// Feature extension identifiers.
pub mod feature_id {
    pub const FEDAUTH: u8 = 0x02;
    pub const TERMINATOR: u8 = 0xFF;
}

/// Federated authentication library and workflow codes.
pub mod fedauth {
    pub const LIBRARY_ADAL: u8 = 0x02;
    pub const WORKFLOW_USER_PASS: u8 = 0x01;
    pub const WORKFLOW_INTEGRATED: u8 = 0x02;
}

/// Fixed part of the LOGIN7 payload.
const LOGIN7_FIXED_SIZE: usize = 94;

/// Encryption negotiation values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encryption {
    Off = 0x00,
    On = 0x01,
    NotSupported = 0x02,
    Required = 0x03,
}

impl TryFrom<u8> for Encryption {
    type Error = ConnectionError;

    fn try_from(b: u8) -> ConnectionResult<Self> {
        match b {
            0x00 => Ok(Encryption::Off),
            0x01 => Ok(Encryption::On),
            0x02 => Ok(Encryption::NotSupported),
            0x03 => Ok(Encryption::Required),
            _ => Err(ConnectionError::protocol(format!(
                "Unknown encryption value in PRELOGIN response: 0x{:02x}",
                b
            ))),
        }
    }
}

// ============================================================================
// Packet Header
// ============================================================================

/// The 8-byte header preceding every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub status: u8,
    /// Total packet length, header included (big-endian on the wire).
    pub length: u16,
    pub spid: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl PacketHeader {
    pub fn new(packet_type: u8, status: u8, length: u16, packet_id: u8) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id,
            window: 0,
        }
    }

    /// Parse a header from exactly `HEADER_SIZE` bytes.
    pub fn decode(buf: &[u8]) -> ConnectionResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ConnectionError::protocol("Incomplete packet header"));
        }
        let mut buf = &buf[..HEADER_SIZE];
        let header = Self {
            packet_type: buf.get_u8(),
            status: buf.get_u8(),
            length: buf.get_u16(),
            spid: buf.get_u16(),
            packet_id: buf.get_u8(),
            window: buf.get_u8(),
        };
        if (header.length as usize) < HEADER_SIZE {
            return Err(ConnectionError::protocol(format!(
                "Packet length {} is shorter than its header",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type);
        buf.put_u8(self.status);
        buf.put_u16(self.length);
        buf.put_u16(self.spid);
        buf.put_u8(self.packet_id);
        buf.put_u8(self.window);
    }

    /// Payload bytes that follow this header.
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }

    pub fn is_end_of_message(&self) -> bool {
        self.status & packet_status::END_OF_MESSAGE != 0
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding client messages into a logical message payload.
pub trait FrontendMessage {
    fn message_type(&self) -> u8;
    fn encode(&self) -> BytesMut;
}

/// PRELOGIN request, and the decoded form of the server's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prelogin {
    pub version: (u8, u8, u16, u16),
    pub encryption: Encryption,
    pub instance: String,
    pub thread_id: u32,
    pub mars: bool,
    /// Connection id, activity id and activity sequence.
    pub trace_id: Option<[u8; 36]>,
    pub fed_auth_required: bool,
}

impl Prelogin {
    pub fn new(encryption: Encryption) -> Self {
        Self {
            version: CLIENT_VERSION,
            encryption,
            instance: String::new(),
            thread_id: std::process::id(),
            mars: false,
            trace_id: None,
            fed_auth_required: false,
        }
    }

    /// Attach freshly generated connection and activity ids.
    pub fn with_trace_id(mut self) -> Self {
        let mut trace = [0u8; 36];
        trace[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        trace[16..32].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        trace[32..].copy_from_slice(&1u32.to_le_bytes());
        self.trace_id = Some(trace);
        self
    }

    /// Decode a PRELOGIN payload.
    pub fn decode(payload: &[u8]) -> ConnectionResult<Self> {
        let mut prelogin = Prelogin {
            version: (0, 0, 0, 0),
            encryption: Encryption::NotSupported,
            instance: String::new(),
            thread_id: 0,
            mars: false,
            trace_id: None,
            fed_auth_required: false,
        };

        let mut cursor = payload;
        loop {
            if !cursor.has_remaining() {
                return Err(ConnectionError::protocol("PRELOGIN option list is not terminated"));
            }
            let token = cursor.get_u8();
            if token == prelogin_option::TERMINATOR {
                break;
            }
            if cursor.remaining() < 4 {
                return Err(ConnectionError::protocol("Truncated PRELOGIN option"));
            }
            let offset = cursor.get_u16() as usize;
            let length = cursor.get_u16() as usize;
            let data = payload.get(offset..offset + length).ok_or_else(|| {
                ConnectionError::protocol(format!(
                    "PRELOGIN option 0x{:02x} points outside the payload",
                    token
                ))
            })?;

            match token {
                prelogin_option::VERSION if length >= 6 => {
                    let mut v = data;
                    prelogin.version = (v.get_u8(), v.get_u8(), v.get_u16(), v.get_u16());
                }
                prelogin_option::ENCRYPTION if length >= 1 => {
                    prelogin.encryption = Encryption::try_from(data[0])?;
                }
                prelogin_option::INSTOPT => {
                    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                    prelogin.instance = String::from_utf8_lossy(&data[..end]).into_owned();
                }
                prelogin_option::THREADID if length >= 4 => {
                    prelogin.thread_id = (&data[..4]).get_u32();
                }
                prelogin_option::MARS if length >= 1 => {
                    prelogin.mars = data[0] == 0x01;
                }
                prelogin_option::FEDAUTHREQUIRED if length >= 1 => {
                    prelogin.fed_auth_required = data[0] == 0x01;
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }
}

impl FrontendMessage for Prelogin {
    fn message_type(&self) -> u8 {
        packet_type::PRELOGIN
    }

    fn encode(&self) -> BytesMut {
        let mut options: Vec<(u8, BytesMut)> = Vec::with_capacity(7);

        let mut version = BytesMut::with_capacity(6);
        version.put_u8(self.version.0);
        version.put_u8(self.version.1);
        version.put_u16(self.version.2);
        version.put_u16(self.version.3);
        options.push((prelogin_option::VERSION, version));

        options.push((prelogin_option::ENCRYPTION, BytesMut::from(&[self.encryption as u8][..])));

        let mut instance = BytesMut::with_capacity(self.instance.len() + 1);
        instance.put_slice(self.instance.as_bytes());
        instance.put_u8(0);
        options.push((prelogin_option::INSTOPT, instance));

        let mut thread = BytesMut::with_capacity(4);
        thread.put_u32(self.thread_id);
        options.push((prelogin_option::THREADID, thread));

        options.push((prelogin_option::MARS, BytesMut::from(&[self.mars as u8][..])));

        if let Some(trace_id) = &self.trace_id {
            options.push((prelogin_option::TRACEID, BytesMut::from(&trace_id[..])));
        }

        if self.fed_auth_required {
            options.push((prelogin_option::FEDAUTHREQUIRED, BytesMut::from(&[0x01u8][..])));
        }

        // 5 bytes per option entry plus the terminator
        let mut offset = options.len() * 5 + 1;
        let mut buf = BytesMut::with_capacity(offset + 64);
        for (token, data) in &options {
            buf.put_u8(*token);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(prelogin_option::TERMINATOR);
        for (_, data) in &options {
            buf.put_slice(data);
        }

        buf
    }
}

/// The FEDAUTH feature extension sent inside LOGIN7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FedAuthFeature {
    pub workflow: u8,
    /// Echo of the server's FEDAUTHREQUIRED answer.
    pub echo: bool,
}

impl FedAuthFeature {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(feature_id::FEDAUTH);
        buf.put_u32_le(2);
        buf.put_u8((fedauth::LIBRARY_ADAL << 1) | self.echo as u8);
        buf.put_u8(self.workflow);
    }
}

/// LOGIN7 message.
#[derive(Debug, Clone)]
pub struct Login7 {
    pub tds_version: u32,
    pub packet_size: u32,
    pub client_prog_ver: u32,
    pub client_pid: u32,
    pub connection_id: u32,
    pub option_flags1: u8,
    pub option_flags2: u8,
    pub type_flags: u8,
    pub option_flags3: u8,
    pub client_time_zone: i32,
    pub client_lcid: u32,
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
    pub server_name: String,
    pub library_name: String,
    pub language: String,
    pub database: String,
    pub client_id: [u8; 6],
    /// SSPI blob (NTLM NEGOTIATE message for integrated login).
    pub sspi: Vec<u8>,
    pub fed_auth: Option<FedAuthFeature>,
}

impl Login7 {
    pub fn new(packet_size: u32) -> Self {
        Self {
            tds_version: TDS_VERSION_7_4,
            packet_size,
            client_prog_ver: 0,
            client_pid: std::process::id(),
            connection_id: 0,
            option_flags1: login_flags::USE_DB_ON | login_flags::INIT_DB_FATAL | login_flags::SET_LANG_ON,
            option_flags2: login_flags::INIT_LANG_FATAL | login_flags::ODBC_ON,
            type_flags: 0,
            option_flags3: login_flags::UNKNOWN_COLLATION_HANDLING | login_flags::EXTENSION_USED,
            client_time_zone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: "tdskit".to_string(),
            language: String::new(),
            database: String::new(),
            client_id: [0; 6],
            sspi: Vec::new(),
            fed_auth: None,
        }
    }

    /// Attach an NTLM NEGOTIATE blob and switch on integrated security.
    pub fn with_sspi(mut self, sspi: Vec<u8>) -> Self {
        self.option_flags2 |= login_flags::INTEGRATED_SECURITY_ON;
        self.sspi = sspi;
        self
    }
}

/// Append a variable-length LOGIN7 field and record its offset/length pair.
fn put_variable(fixed: &mut BytesMut, data: &mut BytesMut, bytes: &[u8], length: u16) {
    fixed.put_u16_le((LOGIN7_FIXED_SIZE + data.len()) as u16);
    fixed.put_u16_le(length);
    data.put_slice(bytes);
}

fn put_variable_str(fixed: &mut BytesMut, data: &mut BytesMut, value: &str) {
    let encoded = string_to_utf16le(value);
    put_variable(fixed, data, &encoded, (encoded.len() / 2) as u16);
}

impl FrontendMessage for Login7 {
    fn message_type(&self) -> u8 {
        packet_type::LOGIN7
    }

    fn encode(&self) -> BytesMut {
        let mut fixed = BytesMut::with_capacity(LOGIN7_FIXED_SIZE);
        let mut data = BytesMut::with_capacity(256);

        // Length placeholder, patched below
        fixed.put_u32_le(0);
        fixed.put_u32_le(self.tds_version);
        fixed.put_u32_le(self.packet_size);
        fixed.put_u32_le(self.client_prog_ver);
        fixed.put_u32_le(self.client_pid);
        fixed.put_u32_le(self.connection_id);
        fixed.put_u8(self.option_flags1);
        fixed.put_u8(self.option_flags2);
        fixed.put_u8(self.type_flags);
        fixed.put_u8(self.option_flags3);
        fixed.put_i32_le(self.client_time_zone);
        fixed.put_u32_le(self.client_lcid);

        put_variable_str(&mut fixed, &mut data, &self.hostname);
        put_variable_str(&mut fixed, &mut data, &self.username);
        let password = obfuscate_password(&self.password);
        put_variable(&mut fixed, &mut data, &password, (password.len() / 2) as u16);
        put_variable_str(&mut fixed, &mut data, &self.app_name);
        put_variable_str(&mut fixed, &mut data, &self.server_name);

        // ibExtension points at a 4-byte offset to the feature block
        let extension_pointer = data.len();
        put_variable(&mut fixed, &mut data, &[0; 4], 4);

        put_variable_str(&mut fixed, &mut data, &self.library_name);
        put_variable_str(&mut fixed, &mut data, &self.language);
        put_variable_str(&mut fixed, &mut data, &self.database);
        fixed.put_slice(&self.client_id);

        let sspi_short = self.sspi.len().min(u16::MAX as usize) as u16;
        put_variable(&mut fixed, &mut data, &self.sspi, sspi_short);

        // Attach DB file and change password are never sent
        put_variable(&mut fixed, &mut data, &[], 0);
        put_variable(&mut fixed, &mut data, &[], 0);
        let sspi_long = if self.sspi.len() > u16::MAX as usize {
            self.sspi.len() as u32
        } else {
            0
        };
        fixed.put_u32_le(sspi_long);

        let feature_offset = (LOGIN7_FIXED_SIZE + data.len()) as u32;
        data[extension_pointer..extension_pointer + 4].copy_from_slice(&feature_offset.to_le_bytes());
        if let Some(fed_auth) = &self.fed_auth {
            fed_auth.encode(&mut data);
        }
        data.put_u8(feature_id::TERMINATOR);

        let total = (fixed.len() + data.len()) as u32;
        fixed[0..4].copy_from_slice(&total.to_le_bytes());
        fixed.put_slice(&data);
        fixed
    }
}

/// Federated authentication token message (type 0x08).
#[derive(Debug, Clone)]
pub struct FedAuthTokenMessage {
    pub token: String,
}

impl FrontendMessage for FedAuthTokenMessage {
    fn message_type(&self) -> u8 {
        packet_type::FEDAUTH_TOKEN
    }

    fn encode(&self) -> BytesMut {
        let token = string_to_utf16le(&self.token);
        let mut buf = BytesMut::with_capacity(8 + token.len());
        // DataLen covers the token length field and the token itself
        buf.put_u32_le(token.len() as u32 + 4);
        buf.put_u32_le(token.len() as u32);
        buf.put_slice(&token);
        buf
    }
}

/// SSPI message carrying an NTLM AUTHENTICATE blob (type 0x11).
#[derive(Debug, Clone)]
pub struct SspiMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SspiMessage {
    fn message_type(&self) -> u8 {
        packet_type::NTLM_AUTH
    }

    fn encode(&self) -> BytesMut {
        BytesMut::from(&self.data[..])
    }
}

/// Attention signal; the payload is empty.
#[derive(Debug, Clone, Copy)]
pub struct AttentionMessage;

impl FrontendMessage for AttentionMessage {
    fn message_type(&self) -> u8 {
        packet_type::ATTENTION
    }

    fn encode(&self) -> BytesMut {
        BytesMut::new()
    }
}

/// ALL_HEADERS with a single transaction descriptor header.
fn put_all_headers(buf: &mut BytesMut, transaction_descriptor: u64) {
    // Total length, then one header: length, type 2, descriptor, outstanding requests
    buf.put_u32_le(22);
    buf.put_u32_le(18);
    buf.put_u16_le(0x0002);
    buf.put_u64_le(transaction_descriptor);
    buf.put_u32_le(1);
}

/// SQL batch message.
#[derive(Debug, Clone)]
pub struct SqlBatch {
    pub sql: String,
    pub transaction_descriptor: u64,
}

impl FrontendMessage for SqlBatch {
    fn message_type(&self) -> u8 {
        packet_type::SQL_BATCH
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(22 + self.sql.len() * 2);
        put_all_headers(&mut buf, self.transaction_descriptor);
        put_utf16(&mut buf, &self.sql);
        buf
    }
}

/// RPC request invoking a stored procedure by name.
#[derive(Debug)]
pub struct RpcRequest<'a> {
    pub procedure: &'a str,
    pub parameters: &'a [Parameter],
    pub options: EncodeOptions,
    pub transaction_descriptor: u64,
}

impl FrontendMessage for RpcRequest<'_> {
    fn message_type(&self) -> u8 {
        packet_type::RPC_REQUEST
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        put_all_headers(&mut buf, self.transaction_descriptor);
        put_us_varchar(&mut buf, self.procedure);
        // Option flags
        buf.put_u16_le(0);
        for parameter in self.parameters {
            parameter.encode_rpc(&mut buf, &self.options);
        }
        buf
    }
}

// ============================================================================
// String helpers
// ============================================================================

/// Encode a string as UTF-16LE bytes.
pub fn string_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Decode UTF-16LE bytes, replacing unpaired surrogates.
pub fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

pub fn put_utf16(buf: &mut BytesMut, s: &str) {
    for unit in s.encode_utf16() {
        buf.put_u16_le(unit);
    }
}

/// String with a one-byte character count.
pub fn put_b_varchar(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(u8::MAX as usize).collect();
    buf.put_u8(units.len() as u8);
    for unit in units {
        buf.put_u16_le(unit);
    }
}

/// String with a two-byte character count.
pub fn put_us_varchar(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().take(u16::MAX as usize).collect();
    buf.put_u16_le(units.len() as u16);
    for unit in units {
        buf.put_u16_le(unit);
    }
}

/// LOGIN7 password obfuscation: UTF-16LE, swap nibbles, XOR 0xA5.
pub fn obfuscate_password(password: &str) -> Vec<u8> {
    string_to_utf16le(password)
        .into_iter()
        .map(|b| ((b << 4) | (b >> 4)) ^ 0xA5)
        .collect()
}
