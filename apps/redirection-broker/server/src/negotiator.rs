//! Redirection handshake state machine.
//!
//! One [`Negotiator`] drives one connected [`TransportChannel`] from `Idle`
//! to either `Authenticated` or `Failed`:
//!
//! ```text
//! Idle --StartRedirectionSession--> AwaitingStartReply
//! AwaitingStartReply --reply(Success)--> AwaitingAuthChallenge
//! AwaitingAuthChallenge --AuthenticateSession(type)--> AwaitingAuthReply
//! AwaitingAuthReply --reply(Success)--> Authenticated
//! AwaitingAuthReply --reply(NotSupported)--> AwaitingAuthChallenge (next type)
//! ```
//!
//! Any other reply status, a transport error or a response timeout moves the
//! machine to `Failed` and nothing further is sent. The only retry inside a
//! single negotiation is the authentication-type fallback, and each type is
//! attempted at most once.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use rand::distributions::Alphanumeric;
use rand::Rng;
use redirection_core::{
    AuthChallenge, AuthRequest, AuthStatus, AuthType, ConnectionParameters, DigestFields,
    HandshakeMessage, ProtocolVersion, RedirectionKind, StartStatus, WireError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::channel::{ChannelError, TransportChannel};

const CNONCE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NegotiationState {
    Idle,
    AwaitingStartReply,
    AwaitingAuthChallenge,
    AwaitingAuthReply,
    Authenticated,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Authenticated | NegotiationState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingStartReply => "awaiting_start_reply",
            NegotiationState::AwaitingAuthChallenge => "awaiting_auth_challenge",
            NegotiationState::AwaitingAuthReply => "awaiting_auth_reply",
            NegotiationState::Authenticated => "authenticated",
            NegotiationState::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("endpoint refused to start the session: {}", .0.as_str())]
    StartRejected(StartStatus),
    #[error("endpoint rejected {0} authentication")]
    AuthRejected(AuthType),
    #[error("no authentication type left to try after {tried:?}")]
    AuthExhausted { tried: Vec<AuthType> },
    #[error("no reply within {timeout:?} while {}", .state.as_str())]
    ResponseTimeout {
        state: NegotiationState,
        timeout: Duration,
    },
    #[error("transport failed during the handshake: {0}")]
    Transport(#[source] ChannelError),
    #[error("endpoint sent a malformed handshake frame: {0}")]
    Malformed(#[source] WireError),
    #[error("unexpected {received} while {}", .state.as_str())]
    UnexpectedMessage {
        state: NegotiationState,
        received: &'static str,
    },
    #[error("negotiation already finished in state {}", .0.as_str())]
    Finished(NegotiationState),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::StartRejected(StartStatus::Busy) => "start_busy",
            HandshakeError::StartRejected(StartStatus::Unsupported) => "start_unsupported",
            HandshakeError::StartRejected(_) => "start_rejected",
            HandshakeError::AuthRejected(_) => "auth_rejected",
            HandshakeError::AuthExhausted { .. } => "auth_exhausted",
            HandshakeError::ResponseTimeout { .. } => "response_timeout",
            HandshakeError::Transport(_) => "transport",
            HandshakeError::Malformed(_) => "malformed",
            HandshakeError::UnexpectedMessage { .. } => "unexpected_message",
            HandshakeError::Finished(_) => "finished",
        }
    }

    /// Whether a fresh `open` after backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HandshakeError::StartRejected(StartStatus::Busy)
                | HandshakeError::ResponseTimeout { .. }
                | HandshakeError::Transport(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub kind: RedirectionKind,
    pub auth_order: Vec<AuthType>,
    pub response_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            kind: RedirectionKind::Sol,
            auth_order: default_auth_order(),
            response_timeout: Duration::from_secs(5),
        }
    }
}

pub fn default_auth_order() -> Vec<AuthType> {
    vec![AuthType::Query, AuthType::UserPass, AuthType::Digest]
}

/// Drops duplicates and the types the negotiator never sends, keeping the
/// first occurrence of each.
pub fn sanitize_auth_order(order: &[AuthType]) -> Vec<AuthType> {
    let mut sanitized = Vec::with_capacity(order.len());
    for auth_type in order {
        match auth_type {
            AuthType::BadDigest => {
                warn!("ignoring bad-digest in the authentication order; it is a test probe only");
            }
            AuthType::Kerberos => {
                warn!("ignoring kerberos in the authentication order; no ticket source is configured");
            }
            other if sanitized.contains(other) => {}
            other => sanitized.push(*other),
        }
    }
    sanitized
}

/// Result of a successful negotiation.
#[derive(Debug)]
pub struct Negotiated {
    pub auth_type: AuthType,
    pub version: ProtocolVersion,
    /// Authentication types the endpoint refused before one succeeded.
    pub rejected: Vec<AuthType>,
    /// Bytes received after the final handshake reply.
    pub leftover: BytesMut,
}

pub struct Negotiator {
    kind: RedirectionKind,
    response_timeout: Duration,
    username: String,
    password: String,
    state: NegotiationState,
    candidates: VecDeque<AuthType>,
    tried: Vec<AuthType>,
    rejected: Vec<AuthType>,
    current: Option<AuthType>,
    challenge: AuthChallenge,
    version: ProtocolVersion,
    buffer: BytesMut,
}

impl Negotiator {
    pub fn new(config: &NegotiatorConfig, params: &ConnectionParameters) -> Self {
        Self {
            kind: config.kind,
            response_timeout: config.response_timeout,
            username: params.username.clone(),
            password: params.password.clone(),
            state: NegotiationState::Idle,
            candidates: sanitize_auth_order(&config.auth_order).into(),
            tried: Vec::new(),
            rejected: Vec::new(),
            current: None,
            challenge: AuthChallenge::default(),
            version: ProtocolVersion::default(),
            buffer: BytesMut::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Authentication types sent so far, in order.
    pub fn attempted(&self) -> &[AuthType] {
        &self.tried
    }

    /// Marks an interrupted negotiation as failed and returns the state it
    /// was in. Used when an outer deadline cancels [`Negotiator::run`].
    pub fn abandon(&mut self) -> NegotiationState {
        let previous = self.state;
        if !previous.is_terminal() {
            self.state = NegotiationState::Failed;
        }
        previous
    }

    pub async fn run(
        &mut self,
        channel: &dyn TransportChannel,
    ) -> Result<Negotiated, HandshakeError> {
        if self.state.is_terminal() {
            return Err(HandshakeError::Finished(self.state));
        }

        loop {
            match self.state {
                NegotiationState::Idle => {
                    let request = HandshakeMessage::StartRedirectionSession { kind: self.kind };
                    self.transmit(channel, &request).await?;
                    self.state = NegotiationState::AwaitingStartReply;
                }
                NegotiationState::AwaitingStartReply => match self.await_reply(channel).await? {
                    HandshakeMessage::StartRedirectionSessionReply {
                        status: StartStatus::Success,
                        version,
                    } => {
                        debug!(
                            major = version.major,
                            minor = version.minor,
                            "redirection session started"
                        );
                        self.version = version;
                        self.state = NegotiationState::AwaitingAuthChallenge;
                    }
                    HandshakeMessage::StartRedirectionSessionReply { status, .. } => {
                        return Err(self.fail(HandshakeError::StartRejected(status)));
                    }
                    other => return Err(self.unexpected(&other)),
                },
                NegotiationState::AwaitingAuthChallenge => {
                    let Some(auth_type) = self.candidates.pop_front() else {
                        let tried = self.tried.clone();
                        return Err(self.fail(HandshakeError::AuthExhausted { tried }));
                    };
                    let request = self.build_request(auth_type);
                    self.transmit(channel, &HandshakeMessage::AuthenticateSession(request))
                        .await?;
                    self.tried.push(auth_type);
                    self.current = Some(auth_type);
                    self.state = NegotiationState::AwaitingAuthReply;
                }
                NegotiationState::AwaitingAuthReply => match self.await_reply(channel).await? {
                    HandshakeMessage::AuthenticateSessionReply {
                        status, challenge, ..
                    } => {
                        if let Some(done) = self.on_auth_reply(status, challenge)? {
                            return Ok(done);
                        }
                    }
                    other => return Err(self.unexpected(&other)),
                },
                NegotiationState::Authenticated | NegotiationState::Failed => {
                    return Err(HandshakeError::Finished(self.state));
                }
            }
        }
    }

    fn on_auth_reply(
        &mut self,
        status: AuthStatus,
        challenge: AuthChallenge,
    ) -> Result<Option<Negotiated>, HandshakeError> {
        let current = self.current.unwrap_or(AuthType::Query);
        match status {
            // A query reply that lists types is a challenge, not a login.
            AuthStatus::Success if current == AuthType::Query && challenge.advertises_any() => {
                debug!(
                    supported = ?challenge.supported,
                    unrecognized = ?challenge.unrecognized,
                    "received authentication challenge"
                );
                self.absorb_challenge(challenge);
                self.state = NegotiationState::AwaitingAuthChallenge;
                Ok(None)
            }
            AuthStatus::Success => {
                self.state = NegotiationState::Authenticated;
                Ok(Some(Negotiated {
                    auth_type: current,
                    version: self.version,
                    rejected: std::mem::take(&mut self.rejected),
                    leftover: std::mem::take(&mut self.buffer),
                }))
            }
            AuthStatus::Fail => Err(self.fail(HandshakeError::AuthRejected(current))),
            AuthStatus::NotSupported => {
                debug!(auth_type = %current, "authentication type not supported, falling back");
                self.rejected.push(current);
                self.absorb_challenge(challenge);
                self.state = NegotiationState::AwaitingAuthChallenge;
                Ok(None)
            }
        }
    }

    /// Narrows the remaining candidates to the advertised types. Unknown
    /// types are never selectable, so a list of only those empties it.
    fn absorb_challenge(&mut self, challenge: AuthChallenge) {
        if challenge.advertises_any() {
            self.candidates
                .retain(|candidate| challenge.supported.contains(candidate));
        }
        if !challenge.realm.is_empty() {
            self.challenge.realm = challenge.realm;
        }
        if !challenge.nonce.is_empty() {
            self.challenge.nonce = challenge.nonce;
        }
    }

    fn build_request(&self, auth_type: AuthType) -> AuthRequest {
        match auth_type {
            AuthType::UserPass => AuthRequest::UserPass {
                username: self.username.clone(),
                password: self.password.clone(),
            },
            AuthType::Digest => {
                let cnonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(CNONCE_LEN)
                    .map(char::from)
                    .collect();
                AuthRequest::Digest(DigestFields::sign(
                    &self.username,
                    &self.password,
                    &self.challenge.realm,
                    &self.challenge.nonce,
                    &cnonce,
                ))
            }
            // Sanitised out of the candidate list.
            AuthType::Query | AuthType::Kerberos | AuthType::BadDigest => AuthRequest::Query,
        }
    }

    async fn transmit(
        &mut self,
        channel: &dyn TransportChannel,
        message: &HandshakeMessage,
    ) -> Result<(), HandshakeError> {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => return Err(self.fail(HandshakeError::Malformed(err))),
        };
        if let Err(err) = channel.send(frame).await {
            return Err(self.fail(HandshakeError::Transport(err)));
        }
        debug!(message = message.name(), "sent handshake message");
        Ok(())
    }

    async fn await_reply(
        &mut self,
        channel: &dyn TransportChannel,
    ) -> Result<HandshakeMessage, HandshakeError> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            match HandshakeMessage::decode(&mut self.buffer) {
                Ok(Some(message)) => {
                    debug!(message = message.name(), "received handshake message");
                    return Ok(message);
                }
                Ok(None) => {}
                Err(err) => return Err(self.fail(HandshakeError::Malformed(err))),
            }

            let chunk = match timeout_at(deadline, channel.receive()).await {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(err)) => return Err(self.fail(HandshakeError::Transport(err))),
                Err(_) => {
                    let state = self.state;
                    return Err(self.fail(HandshakeError::ResponseTimeout {
                        state,
                        timeout: self.response_timeout,
                    }));
                }
            };
            self.buffer.extend_from_slice(&chunk);
        }
    }

    fn unexpected(&mut self, message: &HandshakeMessage) -> HandshakeError {
        let state = self.state;
        self.fail(HandshakeError::UnexpectedMessage {
            state,
            received: message.name(),
        })
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        warn!(state = self.state.as_str(), error = %err, "redirection handshake failed");
        self.state = NegotiationState::Failed;
        err
    }
}
