//! TDS wire protocol implementation.
//!
//! This module provides an async SQL Server client that:
//! - Negotiates TLS inside PRELOGIN packets
//! - Logs in with SQL, NTLM or federated credentials
//! - Follows server redirects and retries transient login failures
//!
//! Architecture:
//! - `protocol`: packet header and client message encoding
//! - `message`: packet framing and message reassembly
//! - `token`: token stream parsing
//! - `state`: lifecycle state tables
//! - `connection`: connection data, handshake driver and requests
//! - `types`: parameter encoding for the supported SQL types

pub mod auth;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod message;
pub mod protocol;
pub mod state;
pub mod tls;
pub mod token;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use auth::{Authentication, CredentialStrategy, NtlmResponder, TokenProvider};
pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionBuilder, RequestOutcome, ResultSet};
pub use decoder::{BuiltinDecoder, TextDecoder};
pub use error::{ConnectionError, ConnectionResult, ErrorKind, RequestError, ValidationError};
pub use state::{Edition, State};
pub use token::{ColumnValue, RoutingData};
pub use transport::{AsyncStream, BoxStream, Connector, TcpConnector};
pub use types::{data_type_by_id, data_type_by_name, DataType, Parameter, SqlValue, Value};
