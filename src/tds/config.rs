//! Connection configuration.
//!
//! A [`Config`] can be built in code, deserialized from JSON with the option
//! names used by the wire-level client (`instanceName`, `trustServerCertificate`,
//! ...), or parsed from an ADO-style connection string.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use super::auth::Authentication;
use super::protocol::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use super::types::LocalTimeZone;

/// Invalid configuration input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Hostname or IP address
    pub server: String,
    /// Port number (default: 1433)
    pub port: u16,
    /// Named instance, announced in PRELOGIN
    pub instance_name: Option<String>,
    /// Initial database
    pub database: Option<String>,
    pub app_name: Option<String>,
    /// Negotiate TLS (default: true)
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    /// Requested packet size (default: 4096)
    pub packet_size: u32,
    /// Connect timeout in milliseconds, covering the whole handshake
    pub connect_timeout: u64,
    /// Request timeout in milliseconds, 0 disables it
    pub request_timeout: u64,
    pub max_retries_on_transient_errors: u32,
    /// Delay before a transient retry, in milliseconds
    pub connection_retry_interval: u64,
    /// Encode temporal parameters in UTC rather than local time
    #[serde(rename = "useUTC")]
    pub use_utc: bool,
    /// IANA zone name used when `use_utc` is off; the process zone when unset
    pub time_zone: Option<String>,
    pub textsize: i32,
    pub language: String,
    pub date_format: String,
    pub datefirst: u8,
    pub authentication: Authentication,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: 1433,
            instance_name: None,
            database: None,
            app_name: None,
            encrypt: true,
            trust_server_certificate: false,
            packet_size: DEFAULT_PACKET_SIZE as u32,
            connect_timeout: 15_000,
            request_timeout: 15_000,
            max_retries_on_transient_errors: 3,
            connection_retry_interval: 500,
            use_utc: true,
            time_zone: None,
            textsize: i32::MAX,
            language: "us_english".to_string(),
            date_format: "mdy".to_string(),
            datefirst: 7,
            authentication: Authentication::default(),
        }
    }
}

impl Config {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Parse a JSON document of connection options.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse an ADO-style connection string.
    ///
    /// Format: `Server=host,port;Database=db;User Id=user;Password=pw;Encrypt=true`
    ///
    /// Timeouts in a connection string are given in seconds.
    pub fn from_connection_string(s: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let mut user_name = String::new();
        let mut password = String::new();
        let mut domain: Option<String> = None;
        let mut auth_method: Option<String> = None;
        let mut client_id: Option<String> = None;
        let mut tenant_id: Option<String> = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ConfigError(format!("Missing '=' in connection string segment: {}", part)))?;
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "server" | "data source" | "address" | "addr" => parse_server(&mut config, value)?,
                "database" | "initial catalog" => config.database = Some(value.to_string()),
                "user id" | "uid" | "user" => user_name = value.to_string(),
                "password" | "pwd" => password = value.to_string(),
                "domain" => domain = Some(value.to_string()),
                "application name" | "app" => config.app_name = Some(value.to_string()),
                "encrypt" => config.encrypt = parse_bool(key, value)?,
                "trustservercertificate" | "trust server certificate" => {
                    config.trust_server_certificate = parse_bool(key, value)?
                }
                "packet size" => config.packet_size = parse_number(key, value)?,
                "connect timeout" | "connection timeout" | "timeout" => {
                    config.connect_timeout = parse_seconds(key, value)?
                }
                "command timeout" => config.request_timeout = parse_seconds(key, value)?,
                "connectretrycount" | "connect retry count" => {
                    config.max_retries_on_transient_errors = parse_number(key, value)?
                }
                "connectretryinterval" | "connect retry interval" => {
                    config.connection_retry_interval = parse_seconds(key, value)?
                }
                "current language" | "language" => config.language = value.to_string(),
                "authentication" => auth_method = Some(value.to_ascii_lowercase().replace([' ', '-'], "")),
                "client id" | "clientid" => client_id = Some(value.to_string()),
                "tenant id" | "tenantid" => tenant_id = Some(value.to_string()),
                other => return Err(ConfigError(format!("Unknown connection string keyword: {}", other))),
            }
        }

        config.authentication = match auth_method.as_deref() {
            None | Some("sqlpassword") => match domain {
                Some(domain) => Authentication::Ntlm {
                    domain,
                    user_name,
                    password,
                },
                None => Authentication::Default { user_name, password },
            },
            Some("activedirectorypassword") => Authentication::AzureActiveDirectoryPassword {
                tenant_id,
                client_id: client_id.ok_or_else(|| ConfigError("ActiveDirectoryPassword requires a Client Id".into()))?,
                user_name,
                password,
            },
            Some("activedirectorymsi") | Some("activedirectorymanagedidentity") => {
                Authentication::AzureActiveDirectoryMsi {
                    client_id: client_id.or(Some(user_name)).filter(|id| !id.is_empty()),
                }
            }
            Some("activedirectorydefault") => Authentication::AzureActiveDirectoryDefault {
                client_id: client_id.or(Some(user_name)).filter(|id| !id.is_empty()),
            },
            Some("activedirectoryserviceprincipal") => Authentication::AzureActiveDirectoryServicePrincipalSecret {
                tenant_id: tenant_id
                    .ok_or_else(|| ConfigError("ActiveDirectoryServicePrincipal requires a Tenant Id".into()))?,
                client_id: user_name,
                client_secret: password,
            },
            Some(other) => return Err(ConfigError(format!("Unsupported authentication method: {}", other))),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError("Server name must not be empty".into()));
        }
        let size = self.packet_size as usize;
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
            return Err(ConfigError(format!(
                "Packet size {} outside {}..={}",
                self.packet_size, MIN_PACKET_SIZE, MAX_PACKET_SIZE
            )));
        }
        if !(1..=7).contains(&self.datefirst) {
            return Err(ConfigError(format!("Invalid datefirst {}", self.datefirst)));
        }
        self.local_time_zone()?;
        Ok(())
    }

    /// Zone applied to values without an offset when `use_utc` is off.
    pub fn local_time_zone(&self) -> Result<LocalTimeZone, ConfigError> {
        match &self.time_zone {
            None => Ok(LocalTimeZone::System),
            Some(name) => name
                .parse()
                .map(LocalTimeZone::Zone)
                .map_err(|_| ConfigError(format!("Unknown time zone: {}", name))),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /// Request timeout, `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout > 0).then(|| Duration::from_millis(self.request_timeout))
    }

    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval)
    }

    /// Session options sent right after login.
    pub fn initial_sql(&self) -> String {
        [
            format!("set textsize {}", self.textsize),
            "set quoted_identifier on".to_string(),
            "set arithabort on".to_string(),
            "set numeric_roundabort off".to_string(),
            "set ansi_warnings on".to_string(),
            "set ansi_padding on".to_string(),
            "set ansi_nulls on".to_string(),
            "set concat_null_yields_null on".to_string(),
            "set cursor_close_on_commit off".to_string(),
            "set implicit_transactions off".to_string(),
            format!("set language {}", self.language),
            format!("set dateformat {}", self.date_format),
            format!("set datefirst {}", self.datefirst),
            "set transaction isolation level read committed".to_string(),
        ]
        .join("\n")
    }
}

/// `host`, `host,port`, `host\instance`, optionally prefixed with `tcp:`.
fn parse_server(config: &mut Config, value: &str) -> Result<(), ConfigError> {
    let value = value.strip_prefix("tcp:").unwrap_or(value);
    let (host, port) = match value.split_once(',') {
        Some((host, port)) => (host, Some(parse_number::<u16>("port", port.trim())?)),
        None => (value, None),
    };
    let host = match host.split_once('\\') {
        Some((host, instance)) => {
            config.instance_name = Some(instance.to_string());
            host
        }
        None => host,
    };
    config.server = match host.trim() {
        "." | "(local)" => "localhost".to_string(),
        h => h.to_string(),
    };
    if let Some(port) = port {
        config.port = port;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "mandatory" | "strict" => Ok(true),
        "false" | "no" | "0" | "optional" => Ok(false),
        _ => Err(ConfigError(format!("Invalid boolean for {}: {}", key.trim(), value))),
    }
}

/// Seconds in a connection string, stored as milliseconds.
fn parse_seconds(key: &str, value: &str) -> Result<u64, ConfigError> {
    parse_number::<u64>(key, value)?
        .checked_mul(1000)
        .ok_or_else(|| ConfigError(format!("{} is out of range: {}", key.trim(), value)))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError(format!("Invalid number for {}: {}", key.trim(), value)))
}
