//! Redirection session broker.
//!
//! [`RedirectionService`] opens authenticated redirection sessions against
//! management controllers, keeps at most one per endpoint in a
//! [`ConnectionRegistry`], and tears them down on close, transport failure,
//! idle timeout or shutdown.

pub mod admin;
pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod facade;
pub mod negotiator;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use channel::{ChannelConnector, ChannelError, TcpChannel, TcpConnector, TransportChannel};
pub use config::{ExistingSessionPolicy, ServiceConfig};
pub use directory::{DirectoryError, EndpointDirectory, StaticDirectory};
pub use error::RedirectionError;
pub use facade::{CloseReason, RedirectionService};
pub use negotiator::{HandshakeError, NegotiationState, Negotiator, NegotiatorConfig};
pub use registry::ConnectionRegistry;
pub use session::{Session, SessionHandle, SessionSnapshot};
