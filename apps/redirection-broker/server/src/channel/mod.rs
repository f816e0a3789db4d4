use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use redirection_core::{ConnectionParameters, EndpointId};
use thiserror::Error;

pub mod mock;
mod tcp;

pub use tcp::{TcpChannel, TcpConnector};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS negotiation with {target} failed: {reason}")]
    Tls { target: String, reason: String },
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ChannelError::Connect { .. } => "connect",
            ChannelError::Tls { .. } => "tls",
            ChannelError::Io(_) => "io",
            ChannelError::NotConnected => "not_connected",
            ChannelError::Closed => "closed",
        }
    }
}

/// Duplex byte channel to one endpoint's management controller.
///
/// Every failure is fatal to the session using the channel; callers never
/// retry on the same channel.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn connect(&self) -> Result<(), ChannelError>;

    async fn send(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Waits for the next chunk of inbound bytes. Chunk boundaries carry no
    /// meaning.
    async fn receive(&self) -> Result<Bytes, ChannelError>;

    /// Releases the underlying connection. Must tolerate repeated calls.
    async fn close(&self);
}

/// Builds an unconnected channel for an endpoint.
pub trait ChannelConnector: Send + Sync {
    fn channel(
        &self,
        endpoint_id: &EndpointId,
        params: &ConnectionParameters,
    ) -> Arc<dyn TransportChannel>;
}
