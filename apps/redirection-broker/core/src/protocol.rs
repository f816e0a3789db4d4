//! Handshake messages exchanged with a management controller and their
//! little-endian framing.
//!
//! Only the four handshake messages are framed here. Redirection traffic
//! that follows a successful handshake is opaque to this crate.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ParseEnumError, RedirectionKind};

const CMD_START_SESSION: u8 = 0x10;
const CMD_START_SESSION_REPLY: u8 = 0x11;
const CMD_AUTHENTICATE: u8 = 0x13;
const CMD_AUTHENTICATE_REPLY: u8 = 0x14;

const START_FRAME_LEN: usize = 8;
const AUTH_HEADER_LEN: usize = 9;

/// Upper bound on an authentication payload accepted by the decoder.
pub const MAX_AUTH_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown handshake command 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("unknown redirection tag {0:?}")]
    UnknownRedirectionTag([u8; 4]),
    #[error("unknown authentication type {0}")]
    UnknownAuthType(u8),
    #[error("authentication payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("field `{0}` is longer than 255 bytes")]
    FieldTooLong(&'static str),
}

impl WireError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            WireError::UnknownCommand(_) => "unknown_command",
            WireError::UnknownRedirectionTag(_) => "unknown_tag",
            WireError::UnknownAuthType(_) => "unknown_auth_type",
            WireError::PayloadTooLarge(_) => "payload_too_large",
            WireError::MalformedPayload(_) => "malformed_payload",
            WireError::FieldTooLong(_) => "field_too_long",
        }
    }
}

/// Status carried by StartRedirectionSessionReply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartStatus {
    Success,
    Unknown,
    Busy,
    Unsupported,
    Error,
}

impl StartStatus {
    pub fn code(self) -> u8 {
        match self {
            StartStatus::Success => 0x00,
            StartStatus::Unknown => 0x01,
            StartStatus::Busy => 0x02,
            StartStatus::Unsupported => 0x03,
            StartStatus::Error => 0xFF,
        }
    }

    /// Unrecognised codes collapse to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => StartStatus::Success,
            0x02 => StartStatus::Busy,
            0x03 => StartStatus::Unsupported,
            0xFF => StartStatus::Error,
            _ => StartStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StartStatus::Success => "success",
            StartStatus::Unknown => "unknown",
            StartStatus::Busy => "busy",
            StartStatus::Unsupported => "unsupported",
            StartStatus::Error => "error",
        }
    }
}

/// Status carried by AuthenticateSessionReply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthStatus {
    Success,
    Fail,
    NotSupported,
}

impl AuthStatus {
    pub fn code(self) -> u8 {
        match self {
            AuthStatus::Success => 0,
            AuthStatus::Fail => 1,
            AuthStatus::NotSupported => 2,
        }
    }

    /// Unrecognised codes collapse to `Fail`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => AuthStatus::Success,
            2 => AuthStatus::NotSupported,
            _ => AuthStatus::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    Query,
    UserPass,
    Kerberos,
    /// Deliberately invalid digest used only to probe endpoint failure
    /// handling. Never sent by the negotiator.
    BadDigest,
    Digest,
}

impl AuthType {
    pub fn code(self) -> u8 {
        match self {
            AuthType::Query => 0,
            AuthType::UserPass => 1,
            AuthType::Kerberos => 2,
            AuthType::BadDigest => 3,
            AuthType::Digest => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::Query => "query",
            AuthType::UserPass => "user-pass",
            AuthType::Kerberos => "kerberos",
            AuthType::BadDigest => "bad-digest",
            AuthType::Digest => "digest",
        }
    }
}

impl TryFrom<u8> for AuthType {
    type Error = WireError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(AuthType::Query),
            1 => Ok(AuthType::UserPass),
            2 => Ok(AuthType::Kerberos),
            3 => Ok(AuthType::BadDigest),
            4 => Ok(AuthType::Digest),
            other => Err(WireError::UnknownAuthType(other)),
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "query" => Ok(AuthType::Query),
            "user-pass" | "userpass" => Ok(AuthType::UserPass),
            "kerberos" => Ok(AuthType::Kerberos),
            "bad-digest" => Ok(AuthType::BadDigest),
            "digest" => Ok(AuthType::Digest),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

/// Fields of a digest authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestFields {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub cnonce: String,
    pub response: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Query,
    UserPass { username: String, password: String },
    Kerberos { ticket: Bytes },
    Digest(DigestFields),
    BadDigest(DigestFields),
}

impl AuthRequest {
    pub fn auth_type(&self) -> AuthType {
        match self {
            AuthRequest::Query => AuthType::Query,
            AuthRequest::UserPass { .. } => AuthType::UserPass,
            AuthRequest::Kerberos { .. } => AuthType::Kerberos,
            AuthRequest::Digest(_) => AuthType::Digest,
            AuthRequest::BadDigest(_) => AuthType::BadDigest,
        }
    }

    fn encode_payload(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::new();
        match self {
            AuthRequest::Query => {}
            AuthRequest::UserPass { username, password } => {
                put_field(&mut out, "username", username.as_bytes())?;
                put_field(&mut out, "password", password.as_bytes())?;
            }
            AuthRequest::Kerberos { ticket } => out.put_slice(ticket),
            AuthRequest::Digest(fields) | AuthRequest::BadDigest(fields) => {
                put_field(&mut out, "username", fields.username.as_bytes())?;
                put_field(&mut out, "realm", fields.realm.as_bytes())?;
                put_field(&mut out, "nonce", fields.nonce.as_bytes())?;
                put_field(&mut out, "cnonce", fields.cnonce.as_bytes())?;
                put_field(&mut out, "response", fields.response.as_bytes())?;
            }
        }
        Ok(out.freeze())
    }

    fn decode_payload(auth_type: AuthType, payload: Bytes) -> Result<Self, WireError> {
        if auth_type == AuthType::Kerberos {
            return Ok(AuthRequest::Kerberos { ticket: payload });
        }
        let mut reader = FieldReader::new(&payload, "authenticate");
        let request = match auth_type {
            AuthType::Query | AuthType::Kerberos => AuthRequest::Query,
            AuthType::UserPass => AuthRequest::UserPass {
                username: reader.string()?,
                password: reader.string()?,
            },
            AuthType::Digest | AuthType::BadDigest => {
                let fields = DigestFields {
                    username: reader.string()?,
                    realm: reader.string()?,
                    nonce: reader.string()?,
                    cnonce: reader.string()?,
                    response: reader.string()?,
                };
                if auth_type == AuthType::Digest {
                    AuthRequest::Digest(fields)
                } else {
                    AuthRequest::BadDigest(fields)
                }
            }
        };
        reader.finish()?;
        Ok(request)
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRequest::Query => f.write_str("Query"),
            AuthRequest::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthRequest::Kerberos { ticket } => f
                .debug_struct("Kerberos")
                .field("ticket_len", &ticket.len())
                .finish(),
            AuthRequest::Digest(fields) => f.debug_tuple("Digest").field(fields).finish(),
            AuthRequest::BadDigest(fields) => f.debug_tuple("BadDigest").field(fields).finish(),
        }
    }
}

/// Data an endpoint returns alongside an authentication reply: the types it
/// accepts and, for digest, the realm and nonce to sign against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthChallenge {
    pub supported: Vec<AuthType>,
    /// Advertised type codes this side has no [`AuthType`] for.
    pub unrecognized: Vec<u8>,
    pub realm: String,
    pub nonce: String,
}

impl AuthChallenge {
    pub fn advertising(supported: impl IntoIterator<Item = AuthType>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_digest(mut self, realm: impl Into<String>, nonce: impl Into<String>) -> Self {
        self.realm = realm.into();
        self.nonce = nonce.into();
        self
    }

    /// Whether the endpoint listed any authentication type at all, known or
    /// not. An endpoint that lists only unknown types still requires a login.
    pub fn advertises_any(&self) -> bool {
        !self.supported.is_empty() || !self.unrecognized.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.advertises_any() && self.realm.is_empty() && self.nonce.is_empty()
    }

    fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::new();
        if self.is_empty() {
            return Ok(out.freeze());
        }
        let count = u8::try_from(self.supported.len() + self.unrecognized.len())
            .map_err(|_| WireError::FieldTooLong("supported"))?;
        out.put_u8(count);
        for auth_type in &self.supported {
            out.put_u8(auth_type.code());
        }
        out.put_slice(&self.unrecognized);
        put_field(&mut out, "realm", self.realm.as_bytes())?;
        put_field(&mut out, "nonce", self.nonce.as_bytes())?;
        Ok(out.freeze())
    }

    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.is_empty() {
            return Ok(Self::default());
        }
        let mut reader = FieldReader::new(payload, "challenge");
        let count = reader.u8()? as usize;
        let mut challenge = Self::default();
        for &code in reader.take(count)? {
            match AuthType::try_from(code) {
                Ok(auth_type) => challenge.supported.push(auth_type),
                Err(_) => challenge.unrecognized.push(code),
            }
        }
        if !reader.is_empty() {
            challenge.realm = reader.string()?;
            challenge.nonce = reader.string()?;
        }
        reader.finish()?;
        Ok(challenge)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    StartRedirectionSession {
        kind: RedirectionKind,
    },
    StartRedirectionSessionReply {
        status: StartStatus,
        version: ProtocolVersion,
    },
    AuthenticateSession(AuthRequest),
    AuthenticateSessionReply {
        status: AuthStatus,
        auth_type: AuthType,
        challenge: AuthChallenge,
    },
}

impl HandshakeMessage {
    pub fn start_reply(status: StartStatus) -> Self {
        HandshakeMessage::StartRedirectionSessionReply {
            status,
            version: ProtocolVersion::default(),
        }
    }

    pub fn auth_reply(status: AuthStatus, auth_type: AuthType) -> Self {
        HandshakeMessage::AuthenticateSessionReply {
            status,
            auth_type,
            challenge: AuthChallenge::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::StartRedirectionSession { .. } => "StartRedirectionSession",
            HandshakeMessage::StartRedirectionSessionReply { .. } => "StartRedirectionSessionReply",
            HandshakeMessage::AuthenticateSession(_) => "AuthenticateSession",
            HandshakeMessage::AuthenticateSessionReply { .. } => "AuthenticateSessionReply",
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::with_capacity(START_FRAME_LEN);
        match self {
            HandshakeMessage::StartRedirectionSession { kind } => {
                out.put_u8(CMD_START_SESSION);
                out.put_bytes(0, 3);
                out.put_slice(&kind.wire_tag());
            }
            HandshakeMessage::StartRedirectionSessionReply { status, version } => {
                out.put_u8(CMD_START_SESSION_REPLY);
                out.put_u8(status.code());
                out.put_bytes(0, 2);
                out.put_u8(version.major);
                out.put_u8(version.minor);
                out.put_bytes(0, 2);
            }
            HandshakeMessage::AuthenticateSession(request) => {
                let payload = request.encode_payload()?;
                put_auth_frame(&mut out, CMD_AUTHENTICATE, 0, request.auth_type(), &payload);
            }
            HandshakeMessage::AuthenticateSessionReply {
                status,
                auth_type,
                challenge,
            } => {
                let payload = challenge.encode()?;
                put_auth_frame(
                    &mut out,
                    CMD_AUTHENTICATE_REPLY,
                    status.code(),
                    *auth_type,
                    &payload,
                );
            }
        }
        Ok(out.freeze())
    }

    /// Decodes one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything while the frame is
    /// incomplete; bytes past the decoded frame stay in `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, WireError> {
        let Some(&command) = buf.first() else {
            return Ok(None);
        };
        match command {
            CMD_START_SESSION => {
                if buf.len() < START_FRAME_LEN {
                    return Ok(None);
                }
                let frame = buf.split_to(START_FRAME_LEN);
                let tag = [frame[4], frame[5], frame[6], frame[7]];
                let kind = RedirectionKind::from_wire_tag(tag)
                    .ok_or(WireError::UnknownRedirectionTag(tag))?;
                Ok(Some(HandshakeMessage::StartRedirectionSession { kind }))
            }
            CMD_START_SESSION_REPLY => {
                if buf.len() < START_FRAME_LEN {
                    return Ok(None);
                }
                let frame = buf.split_to(START_FRAME_LEN);
                Ok(Some(HandshakeMessage::StartRedirectionSessionReply {
                    status: StartStatus::from_code(frame[1]),
                    version: ProtocolVersion {
                        major: frame[4],
                        minor: frame[5],
                    },
                }))
            }
            CMD_AUTHENTICATE | CMD_AUTHENTICATE_REPLY => {
                if buf.len() < AUTH_HEADER_LEN {
                    return Ok(None);
                }
                let len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                if len > MAX_AUTH_PAYLOAD {
                    return Err(WireError::PayloadTooLarge(len));
                }
                if buf.len() < AUTH_HEADER_LEN + len {
                    return Ok(None);
                }
                let mut frame = buf.split_to(AUTH_HEADER_LEN + len);
                let header = frame.split_to(AUTH_HEADER_LEN);
                let auth_type = AuthType::try_from(header[4])?;
                let payload = frame.freeze();
                if command == CMD_AUTHENTICATE {
                    Ok(Some(HandshakeMessage::AuthenticateSession(
                        AuthRequest::decode_payload(auth_type, payload)?,
                    )))
                } else {
                    Ok(Some(HandshakeMessage::AuthenticateSessionReply {
                        status: AuthStatus::from_code(header[1]),
                        auth_type,
                        challenge: AuthChallenge::decode(&payload)?,
                    }))
                }
            }
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

fn put_auth_frame(out: &mut BytesMut, command: u8, status: u8, auth_type: AuthType, payload: &[u8]) {
    out.reserve(AUTH_HEADER_LEN + payload.len());
    out.put_u8(command);
    out.put_u8(status);
    out.put_bytes(0, 2);
    out.put_u8(auth_type.code());
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
}

fn put_field(out: &mut BytesMut, name: &'static str, value: &[u8]) -> Result<(), WireError> {
    let len = u8::try_from(value.len()).map_err(|_| WireError::FieldTooLong(name))?;
    out.put_u8(len);
    out.put_slice(value);
    Ok(())
}

struct FieldReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::MalformedPayload(self.what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::MalformedPayload(self.what))
    }

    fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::MalformedPayload(self.what))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn start_session_frame_layout() {
        let bytes = HandshakeMessage::StartRedirectionSession {
            kind: RedirectionKind::Kvm,
        }
        .encode()
        .unwrap();
        assert_eq!(&bytes[..], &[0x10, 0, 0, 0, b'K', b'V', b'M', b'R']);
    }

    #[test_timeout::timeout]
    fn partial_frames_are_left_in_place() {
        let full = HandshakeMessage::AuthenticateSession(AuthRequest::UserPass {
            username: "admin".into(),
            password: "pw".into(),
        })
        .encode()
        .unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(HandshakeMessage::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), full.len() - 1);

        buf.extend_from_slice(&full[full.len() - 1..]);
        let decoded = HandshakeMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            HandshakeMessage::AuthenticateSession(AuthRequest::UserPass {
                username: "admin".into(),
                password: "pw".into(),
            })
        );
        assert!(buf.is_empty());
    }

    #[test_timeout::timeout]
    fn trailing_bytes_survive_decode() {
        let reply = HandshakeMessage::auth_reply(AuthStatus::Success, AuthType::Digest)
            .encode()
            .unwrap();
        let mut buf = BytesMut::from(&reply[..]);
        buf.extend_from_slice(b"console");
        let decoded = HandshakeMessage::decode(&mut buf).unwrap();
        assert!(matches!(
            decoded,
            Some(HandshakeMessage::AuthenticateSessionReply {
                status: AuthStatus::Success,
                auth_type: AuthType::Digest,
                ..
            })
        ));
        assert_eq!(&buf[..], b"console");
    }

    #[test_timeout::timeout]
    fn unknown_status_codes_collapse() {
        let mut buf = BytesMut::from(&[0x11, 0x42, 0, 0, 1, 0, 0, 0][..]);
        let decoded = HandshakeMessage::decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            HandshakeMessage::start_reply(StartStatus::Unknown)
        );
        assert_eq!(StartStatus::from_code(0xFF), StartStatus::Error);
        assert_eq!(AuthStatus::from_code(9), AuthStatus::Fail);
    }

    #[test_timeout::timeout]
    fn challenge_carries_types_and_digest_material() {
        let reply = HandshakeMessage::AuthenticateSessionReply {
            status: AuthStatus::Success,
            auth_type: AuthType::Query,
            challenge: AuthChallenge::advertising([AuthType::UserPass, AuthType::Digest])
                .with_digest("Digest:ABCD", "n0nce"),
        };
        let mut buf = BytesMut::from(&reply.encode().unwrap()[..]);
        assert_eq!(HandshakeMessage::decode(&mut buf).unwrap(), Some(reply));
    }

    #[test_timeout::timeout]
    fn unknown_advertised_types_are_kept_apart() {
        // Query reply, success, one advertised type 0x09, realm "R", nonce "N".
        let mut buf = BytesMut::from(
            &[0x14, 0, 0, 0, 0, 6, 0, 0, 0, 1, 0x09, 1, b'R', 1, b'N'][..],
        );
        let Some(HandshakeMessage::AuthenticateSessionReply { challenge, .. }) =
            HandshakeMessage::decode(&mut buf).unwrap()
        else {
            panic!("expected an authentication reply");
        };
        assert!(challenge.supported.is_empty());
        assert_eq!(challenge.unrecognized, vec![0x09]);
        assert!(challenge.advertises_any());
        assert_eq!(challenge.realm, "R");
        assert_eq!(challenge.nonce, "N");
        assert!(buf.is_empty());
    }

    #[test_timeout::timeout]
    fn rejects_garbage() {
        let mut buf = BytesMut::from(&[0x99, 1, 2, 3][..]);
        assert_eq!(
            HandshakeMessage::decode(&mut buf),
            Err(WireError::UnknownCommand(0x99))
        );

        let mut oversized = BytesMut::from(&[0x14, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0x00][..]);
        assert!(matches!(
            HandshakeMessage::decode(&mut oversized),
            Err(WireError::PayloadTooLarge(_))
        ));

        let mut bad_type = BytesMut::from(&[0x13, 0, 0, 0, 7, 0, 0, 0, 0][..]);
        assert_eq!(
            HandshakeMessage::decode(&mut bad_type),
            Err(WireError::UnknownAuthType(7))
        );
    }

    #[test_timeout::timeout]
    fn long_fields_are_refused_on_encode() {
        let request = AuthRequest::UserPass {
            username: "u".repeat(300),
            password: String::new(),
        };
        assert_eq!(
            HandshakeMessage::AuthenticateSession(request).encode(),
            Err(WireError::FieldTooLong("username"))
        );
    }

    #[test_timeout::timeout]
    fn auth_type_names_parse() {
        assert_eq!("user_pass".parse::<AuthType>().unwrap(), AuthType::UserPass);
        assert_eq!("Digest".parse::<AuthType>().unwrap(), AuthType::Digest);
        assert!("ntlm".parse::<AuthType>().is_err());
    }
}
