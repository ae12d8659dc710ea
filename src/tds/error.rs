//! Error types for the TDS protocol implementation.
//!
//! Two disjoint families are surfaced to callers:
//! - `ConnectionError`: handshake and transport failures, carrying a transience flag
//! - `RequestError`: failures of a single SQL batch or procedure call
//!
//! `ValidationError` is local to one parameter value and never touches the
//! connection state.

use std::fmt;
use std::io;
use std::sync::Arc;

use super::config::ConfigError;

/// Result type for connection-level operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Boxed error returned by the pluggable capabilities (token provider, NTLM responder).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Machine-readable error codes.
pub mod codes {
    pub const ESOCKET: &str = "ESOCKET";
    pub const ETIMEOUT: &str = "ETIMEOUT";
    pub const EPROTOCOL: &str = "EPROTOCOL";
    pub const ELOGIN: &str = "ELOGIN";
    pub const EFEDAUTH: &str = "EFEDAUTH";
    pub const ENTLM: &str = "ENTLM";
    pub const EAUTHKIND: &str = "EAUTHKIND";
    pub const EENCRYPT: &str = "EENCRYPT";
    pub const ETLS: &str = "ETLS";
    pub const ECLOSED: &str = "ECLOSED";
    pub const EINVALIDSTATE: &str = "EINVALIDSTATE";
    pub const ECANCEL: &str = "ECANCEL";
    pub const EREQUEST: &str = "EREQUEST";
    pub const ECONFIG: &str = "ECONFIG";
}

/// Server error numbers that indicate a retryable login failure.
///
/// 4060: cannot open database, 10928/10929: resource limits,
/// 40197/40501/40613: service busy or database unavailable.
const TRANSIENT_ERROR_NUMBERS: [i32; 6] = [4060, 10928, 10929, 40197, 40501, 40613];

/// Whether a server error number is worth a login retry.
pub fn is_transient_error_number(number: i32) -> bool {
    TRANSIENT_ERROR_NUMBERS.contains(&number)
}

// ============================================================================
// Connection errors
// ============================================================================

/// Broad classification of a connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level failure, connect timeout or cancellation.
    Transport,
    /// Malformed packet or token stream.
    Protocol,
    /// Login rejected, credential or NTLM failure.
    Authentication,
    /// Options refused before any connection attempt.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "TransportError"),
            ErrorKind::Protocol => write!(f, "ProtocolError"),
            ErrorKind::Authentication => write!(f, "AuthenticationError"),
            ErrorKind::Configuration => write!(f, "ConfigurationError"),
        }
    }
}

/// A connection-level error.
///
/// When built with [`ConnectionError::aggregate`] it also carries an inner
/// cause. Transience is always a property of this error, never of the cause.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
    transient: bool,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ConnectionError {
    fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            transient: false,
            cause: None,
        }
    }

    pub fn transport(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, code, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, codes::EPROTOCOL, message)
    }

    pub fn authentication(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, code, message)
    }

    /// The generic failure used when the server neither acknowledged nor rejected the login.
    pub fn login_failed() -> Self {
        Self::authentication(codes::ELOGIN, "Login failed.")
    }

    /// Group an inner cause with a primary connection error.
    pub fn aggregate(primary: ConnectionError, cause: BoxError) -> Self {
        Self {
            cause: Some(Arc::from(cause)),
            ..primary
        }
    }

    /// Set the transience flag.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_aggregate(&self) -> bool {
        self.cause.is_some()
    }

    /// The wrapped cause of an aggregate error.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, "\nCaused by: {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref() as &(dyn std::error::Error + 'static)),
            None => None,
        }
    }
}

impl From<ConfigError> for ConnectionError {
    fn from(e: ConfigError) -> Self {
        ConnectionError::new(ErrorKind::Configuration, codes::ECONFIG, e.0)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        let message = match e.kind() {
            io::ErrorKind::UnexpectedEof => "Connection lost - read ECONNRESET".to_string(),
            _ => e.to_string(),
        };
        ConnectionError::transport(codes::ESOCKET, message)
    }
}

// ============================================================================
// Request errors
// ============================================================================

/// A request-level error, usually reported by the server through an ERROR token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub code: &'static str,
    pub message: String,
    pub number: Option<i32>,
    pub state: Option<u8>,
    pub class: Option<u8>,
    pub server_name: Option<String>,
    pub proc_name: Option<String>,
    pub line_number: Option<u32>,
}

impl RequestError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            number: None,
            state: None,
            class: None,
            server_name: None,
            proc_name: None,
            line_number: None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number {
            Some(number) => write!(f, "{} (error {}): {}", self.code, number, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<ConnectionError> for RequestError {
    fn from(e: ConnectionError) -> Self {
        RequestError::new(e.code(), e.message())
    }
}

// ============================================================================
// Validation errors
// ============================================================================

/// A parameter value rejected by a data type's `validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub type_name: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(type_name: &'static str, message: impl Into<String>) -> Self {
        Self {
            type_name,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed for parameter of type {}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for ValidationError {}
