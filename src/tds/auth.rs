//! Authentication descriptor and the injected credential capabilities.
//!
//! The descriptor selects the login flavour:
//! - `default`: SQL login, user name and password in LOGIN7
//! - `ntlm`: Windows login over an SSPI exchange
//! - `azure-active-directory-*`: federated login with a bearer token
//!
//! Token acquisition and the NTLM response computation are not done here.
//! They come from a [`TokenProvider`] and an [`NtlmResponder`] handed to the
//! connection.

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::Deserialize;

use super::error::BoxError;
use super::protocol::fedauth;

/// Authentication descriptor, tagged by `type` with its fields under `options`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "kebab-case")]
pub enum Authentication {
    #[serde(rename_all = "camelCase")]
    Default { user_name: String, password: String },
    #[serde(rename_all = "camelCase")]
    Ntlm {
        domain: String,
        user_name: String,
        password: String,
    },
    #[serde(rename_all = "camelCase")]
    AzureActiveDirectoryPassword {
        #[serde(default)]
        tenant_id: Option<String>,
        client_id: String,
        user_name: String,
        password: String,
    },
    #[serde(rename_all = "camelCase")]
    AzureActiveDirectoryMsi {
        #[serde(default)]
        client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AzureActiveDirectoryDefault {
        #[serde(default)]
        client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AzureActiveDirectoryServicePrincipalSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl Default for Authentication {
    fn default() -> Self {
        Authentication::Default {
            user_name: String::new(),
            password: String::new(),
        }
    }
}

impl Authentication {
    /// The descriptor tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Authentication::Default { .. } => "default",
            Authentication::Ntlm { .. } => "ntlm",
            Authentication::AzureActiveDirectoryPassword { .. } => "azure-active-directory-password",
            Authentication::AzureActiveDirectoryMsi { .. } => "azure-active-directory-msi",
            Authentication::AzureActiveDirectoryDefault { .. } => "azure-active-directory-default",
            Authentication::AzureActiveDirectoryServicePrincipalSecret { .. } => {
                "azure-active-directory-service-principal-secret"
            }
        }
    }

    pub fn is_federated(&self) -> bool {
        self.credential_strategy().is_some()
    }

    /// FEDAUTH workflow byte announced in LOGIN7.
    pub fn fed_auth_workflow(&self) -> Option<u8> {
        match self {
            Authentication::AzureActiveDirectoryPassword { .. } => Some(fedauth::WORKFLOW_USER_PASS),
            Authentication::AzureActiveDirectoryMsi { .. }
            | Authentication::AzureActiveDirectoryDefault { .. }
            | Authentication::AzureActiveDirectoryServicePrincipalSecret { .. } => {
                Some(fedauth::WORKFLOW_INTEGRATED)
            }
            _ => None,
        }
    }

    /// How a federated token is obtained for this descriptor.
    pub fn credential_strategy(&self) -> Option<CredentialStrategy> {
        let strategy = match self {
            Authentication::AzureActiveDirectoryPassword {
                tenant_id,
                client_id,
                user_name,
                password,
            } => CredentialStrategy::Password {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                user_name: user_name.clone(),
                password: password.clone(),
            },
            Authentication::AzureActiveDirectoryMsi { client_id } => CredentialStrategy::ManagedIdentity {
                client_id: client_id.clone(),
            },
            Authentication::AzureActiveDirectoryDefault { client_id } => CredentialStrategy::DefaultChain {
                client_id: client_id.clone(),
            },
            Authentication::AzureActiveDirectoryServicePrincipalSecret {
                tenant_id,
                client_id,
                client_secret,
            } => CredentialStrategy::ServicePrincipalSecret {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            },
            Authentication::Default { .. } | Authentication::Ntlm { .. } => return None,
        };
        Some(strategy)
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets stay out of logs
        let mut s = f.debug_struct("Authentication");
        s.field("type", &self.kind());
        match self {
            Authentication::Default { user_name, .. } => s.field("user_name", user_name),
            Authentication::Ntlm { domain, user_name, .. } => {
                s.field("domain", domain).field("user_name", user_name)
            }
            Authentication::AzureActiveDirectoryPassword { user_name, client_id, .. } => {
                s.field("client_id", client_id).field("user_name", user_name)
            }
            Authentication::AzureActiveDirectoryMsi { client_id }
            | Authentication::AzureActiveDirectoryDefault { client_id } => s.field("client_id", client_id),
            Authentication::AzureActiveDirectoryServicePrincipalSecret { client_id, .. } => {
                s.field("client_id", client_id)
            }
        };
        s.finish()
    }
}

/// Credential strategy handed to the [`TokenProvider`].
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialStrategy {
    Password {
        tenant_id: Option<String>,
        client_id: String,
        user_name: String,
        password: String,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
    DefaultChain {
        client_id: Option<String>,
    },
    ServicePrincipalSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl CredentialStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialStrategy::Password { .. } => "password",
            CredentialStrategy::ManagedIdentity { .. } => "managed-identity",
            CredentialStrategy::DefaultChain { .. } => "default",
            CredentialStrategy::ServicePrincipalSecret { .. } => "service-principal-secret",
        }
    }
}

impl fmt::Debug for CredentialStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CredentialStrategy").field(&self.name()).finish()
    }
}

/// Token scope for a server SPN.
pub fn token_scope(spn: &str) -> String {
    format!("{}/.default", spn)
}

/// Acquires a federated-auth bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, strategy: &CredentialStrategy, scope: &str) -> Result<String, BoxError>;
}

/// Computes the NTLM AUTHENTICATE message for a server challenge.
pub trait NtlmResponder: Send + Sync {
    fn respond(&self, challenge: &[u8], domain: &str, username: &str, password: &str) -> Result<Vec<u8>, BoxError>;
}

// ============================================================================
// NTLM NEGOTIATE
// ============================================================================

mod ntlm_flags {
    pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
    pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
    pub const REQUEST_TARGET: u32 = 0x0000_0004;
    pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
    pub const OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
    pub const OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
    pub const ALWAYS_SIGN: u32 = 0x0000_8000;
    pub const EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
    pub const NEGOTIATE_128: u32 = 0x2000_0000;
    pub const NEGOTIATE_56: u32 = 0x8000_0000;
}

const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NEGOTIATE_HEADER_SIZE: usize = 32;

/// NTLM NEGOTIATE message carried in the SSPI field of LOGIN7.
pub fn ntlm_negotiate(domain: &str, workstation: &str) -> Vec<u8> {
    use ntlm_flags::*;

    let domain = domain.to_ascii_uppercase();
    let workstation = workstation.to_ascii_uppercase();
    let flags = NEGOTIATE_UNICODE
        | NEGOTIATE_OEM
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | OEM_DOMAIN_SUPPLIED
        | OEM_WORKSTATION_SUPPLIED
        | ALWAYS_SIGN
        | EXTENDED_SESSION_SECURITY
        | NEGOTIATE_128
        | NEGOTIATE_56;

    let mut buf = BytesMut::with_capacity(NEGOTIATE_HEADER_SIZE + domain.len() + workstation.len());
    buf.put_slice(NTLM_SIGNATURE);
    buf.put_u32_le(1);
    buf.put_u32_le(flags);

    let domain_offset = NEGOTIATE_HEADER_SIZE;
    buf.put_u16_le(domain.len() as u16);
    buf.put_u16_le(domain.len() as u16);
    buf.put_u32_le(domain_offset as u32);

    let workstation_offset = domain_offset + domain.len();
    buf.put_u16_le(workstation.len() as u16);
    buf.put_u16_le(workstation.len() as u16);
    buf.put_u32_le(workstation_offset as u32);

    buf.put_slice(domain.as_bytes());
    buf.put_slice(workstation.as_bytes());
    buf.to_vec()
}
