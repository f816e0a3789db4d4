use redirection_core::EndpointId;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::directory::DirectoryError;
use crate::negotiator::{HandshakeError, NegotiationState};

/// Errors surfaced by [`crate::RedirectionService`].
#[derive(Debug, Error)]
pub enum RedirectionError {
    #[error("could not resolve endpoint {endpoint}: {source}")]
    ResolutionFailed {
        endpoint: EndpointId,
        #[source]
        source: DirectoryError,
    },
    #[error("transport failure: {0}")]
    TransportFailed(#[source] ChannelError),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(#[source] HandshakeError),
    #[error("handshake timed out while {}", .state.as_str())]
    HandshakeTimedOut { state: NegotiationState },
    #[error("endpoint {0} already has an active redirection session")]
    AlreadyActive(EndpointId),
    #[error("no active redirection session for endpoint {0}")]
    NotFound(EndpointId),
    #[error("redirection session for endpoint {0} is closed")]
    Closed(EndpointId),
}

impl RedirectionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RedirectionError::ResolutionFailed { .. } => "resolution_failed",
            RedirectionError::TransportFailed(_) => "transport_failed",
            RedirectionError::HandshakeRejected(_) => "handshake_rejected",
            RedirectionError::HandshakeTimedOut { .. } => "handshake_timed_out",
            RedirectionError::AlreadyActive(_) => "already_active",
            RedirectionError::NotFound(_) => "not_found",
            RedirectionError::Closed(_) => "closed",
        }
    }

    /// Whether a later `open` for the same endpoint may succeed without any
    /// configuration change. `AlreadyActive` clears once the existing session
    /// closes.
    pub fn is_retryable(&self) -> bool {
        match self {
            RedirectionError::ResolutionFailed { source, .. } => {
                matches!(source, DirectoryError::Unavailable(_))
            }
            RedirectionError::TransportFailed(_)
            | RedirectionError::HandshakeTimedOut { .. }
            | RedirectionError::AlreadyActive(_) => true,
            RedirectionError::HandshakeRejected(err) => err.is_retryable(),
            RedirectionError::NotFound(_) | RedirectionError::Closed(_) => false,
        }
    }
}

impl From<HandshakeError> for RedirectionError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Transport(source) => RedirectionError::TransportFailed(source),
            HandshakeError::ResponseTimeout { state, .. } => {
                RedirectionError::HandshakeTimedOut { state }
            }
            other => RedirectionError::HandshakeRejected(other),
        }
    }
}
