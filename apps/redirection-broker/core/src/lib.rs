//! Shared primitives for the redirection session broker: endpoint identity,
//! connection parameters and the handshake messages exchanged with a
//! management controller before redirection traffic may flow.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod digest;
pub mod protocol;

pub use protocol::{
    AuthChallenge, AuthRequest, AuthStatus, AuthType, DigestFields, HandshakeMessage,
    ProtocolVersion, StartStatus, WireError,
};

/// Default management port for plain-text redirection.
pub const DEFAULT_REDIRECTION_PORT: u16 = 16994;
/// Default management port for TLS redirection.
pub const DEFAULT_REDIRECTION_TLS_PORT: u16 = 16995;

/// Opaque identifier of a managed endpoint. Scopes at most one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Parameters needed to reach one endpoint's management controller.
///
/// Resolved once per `open` and copied into the session, so later edits to
/// the directory never alias a live session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub allow_self_signed: bool,
}

impl ConnectionParameters {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port: None,
            username: username.into(),
            password: password.into(),
            use_tls: false,
            allow_self_signed: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, allow_self_signed: bool) -> Self {
        self.use_tls = true;
        self.allow_self_signed = allow_self_signed;
        self
    }

    /// Port to dial, falling back to the protocol default for the TLS mode.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.use_tls {
            DEFAULT_REDIRECTION_TLS_PORT
        } else {
            DEFAULT_REDIRECTION_PORT
        })
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("address", &self.address)
            .field("port", &self.effective_port())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .field("allow_self_signed", &self.allow_self_signed)
            .finish()
    }
}

/// Kind of interactive traffic carried by a redirection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectionKind {
    /// Serial-over-LAN.
    Sol,
    /// Keyboard, video and mouse.
    Kvm,
    /// IDE redirection.
    Ider,
}

impl RedirectionKind {
    /// Four byte tag sent in StartRedirectionSession.
    pub fn wire_tag(self) -> [u8; 4] {
        match self {
            RedirectionKind::Sol => *b"SOL ",
            RedirectionKind::Kvm => *b"KVMR",
            RedirectionKind::Ider => *b"IDER",
        }
    }

    pub fn from_wire_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"SOL " => Some(RedirectionKind::Sol),
            b"KVMR" => Some(RedirectionKind::Kvm),
            b"IDER" => Some(RedirectionKind::Ider),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RedirectionKind::Sol => "sol",
            RedirectionKind::Kvm => "kvm",
            RedirectionKind::Ider => "ider",
        }
    }
}

impl fmt::Display for RedirectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unrecognised value `{0}`")]
pub struct ParseEnumError(pub String);

impl FromStr for RedirectionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sol" => Ok(RedirectionKind::Sol),
            "kvm" => Ok(RedirectionKind::Kvm),
            "ider" => Ok(RedirectionKind::Ider),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn effective_port_follows_tls_mode() {
        let plain = ConnectionParameters::new("10.0.0.5", "admin", "pw");
        assert_eq!(plain.effective_port(), DEFAULT_REDIRECTION_PORT);

        let tls = plain.clone().with_tls(true);
        assert_eq!(tls.effective_port(), DEFAULT_REDIRECTION_TLS_PORT);

        let pinned = tls.with_port(9000);
        assert_eq!(pinned.effective_port(), 9000);
    }

    #[test_timeout::timeout]
    fn debug_output_hides_password() {
        let params = ConnectionParameters::new("host", "admin", "hunter2");
        let rendered = format!("{params:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test_timeout::timeout]
    fn kind_parses_case_insensitively() {
        assert_eq!("KVM".parse::<RedirectionKind>().unwrap(), RedirectionKind::Kvm);
        assert_eq!(RedirectionKind::from_wire_tag(*b"IDER"), Some(RedirectionKind::Ider));
        assert!("vnc".parse::<RedirectionKind>().is_err());
    }
}
