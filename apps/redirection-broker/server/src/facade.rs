//! Public operation surface: `open`, `send`, `receive`, `close`.
//!
//! Failures during `open` leave no registry trace and close the channel that
//! was opened for the attempt. Failures during `send`/`receive` retire the
//! session before the error is returned, so an endpoint is never left marked
//! active against a broken channel.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use redirection_core::EndpointId;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::ChannelConnector;
use crate::config::{ExistingSessionPolicy, ServiceConfig};
use crate::directory::EndpointDirectory;
use crate::error::RedirectionError;
use crate::negotiator::{Negotiator, NegotiatorConfig};
use crate::registry::ConnectionRegistry;
use crate::session::{now_millis, Session, SessionHandle, SessionIoError, SessionSnapshot};
use crate::telemetry::HANDSHAKE_DURATION_METRIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Explicit,
    TransportError,
    Idle,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Explicit => "explicit",
            CloseReason::TransportError => "transport_error",
            CloseReason::Idle => "idle",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone)]
pub struct RedirectionService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    directory: Arc<dyn EndpointDirectory>,
    connector: Arc<dyn ChannelConnector>,
    registry: ConnectionRegistry,
    negotiator: NegotiatorConfig,
    config: ServiceConfig,
}

impl RedirectionService {
    pub fn new(
        directory: Arc<dyn EndpointDirectory>,
        connector: Arc<dyn ChannelConnector>,
        config: ServiceConfig,
    ) -> Self {
        Self::with_registry(directory, connector, ConnectionRegistry::new(), config)
    }

    pub fn with_registry(
        directory: Arc<dyn EndpointDirectory>,
        connector: Arc<dyn ChannelConnector>,
        registry: ConnectionRegistry,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                directory,
                connector,
                registry,
                negotiator: config.negotiator(),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub async fn open(&self, endpoint_id: &EndpointId) -> Result<SessionHandle, RedirectionError> {
        match self.establish(endpoint_id).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                counter!(
                    "redirection_open_failures_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(endpoint_id = %endpoint_id, error = %err, "failed to open redirection session");
                Err(err)
            }
        }
    }

    async fn establish(&self, endpoint_id: &EndpointId) -> Result<SessionHandle, RedirectionError> {
        if let Some(existing) = self.inner.registry.lookup(endpoint_id) {
            return self.existing(endpoint_id, &existing);
        }

        let params = self
            .inner
            .directory
            .resolve(endpoint_id)
            .await
            .map_err(|source| RedirectionError::ResolutionFailed {
                endpoint: endpoint_id.clone(),
                source,
            })?;

        let channel = self.inner.connector.channel(endpoint_id, &params);
        let mut negotiator = Negotiator::new(&self.inner.negotiator, &params);
        let kind = self.inner.negotiator.kind;
        let started = Instant::now();

        let outcome = timeout(self.inner.config.handshake_timeout, async {
            channel
                .connect()
                .await
                .map_err(RedirectionError::TransportFailed)?;
            negotiator
                .run(channel.as_ref())
                .await
                .map_err(RedirectionError::from)
        })
        .await;

        let negotiated = match outcome {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(err)) => {
                channel.close().await;
                return Err(err);
            }
            Err(_) => {
                let state = negotiator.abandon();
                channel.close().await;
                return Err(RedirectionError::HandshakeTimedOut { state });
            }
        };

        histogram!(
            HANDSHAKE_DURATION_METRIC,
            started.elapsed().as_secs_f64() * 1000.0,
            "kind" => kind.as_str()
        );
        for rejected in &negotiated.rejected {
            counter!(
                "redirection_auth_fallbacks_total",
                1,
                "auth_type" => rejected.as_str()
            );
        }

        let session = Arc::new(Session::new(endpoint_id.clone(), kind, negotiated, channel));
        if !self
            .inner
            .registry
            .try_register(endpoint_id.clone(), Arc::clone(&session))
        {
            // Lost the race; this attempt's channel must not outlive it.
            session.close().await;
            debug!(endpoint_id = %endpoint_id, "discarded session that lost the registration race");
            return match self.inner.registry.lookup(endpoint_id) {
                Some(existing) => self.existing(endpoint_id, &existing),
                None => Err(RedirectionError::AlreadyActive(endpoint_id.clone())),
            };
        }

        let handle = session.handle().clone();
        counter!(
            "redirection_sessions_opened_total",
            1,
            "kind" => handle.kind.as_str(),
            "auth_type" => handle.auth_type.as_str()
        );
        gauge!("redirection_sessions_active", self.inner.registry.len() as f64);
        info!(
            endpoint_id = %endpoint_id,
            session_id = %handle.session_id,
            kind = %handle.kind,
            auth_type = %handle.auth_type,
            "redirection session established"
        );
        Ok(handle)
    }

    fn existing(
        &self,
        endpoint_id: &EndpointId,
        session: &Session,
    ) -> Result<SessionHandle, RedirectionError> {
        match self.inner.config.existing_session {
            ExistingSessionPolicy::Adopt => {
                debug!(endpoint_id = %endpoint_id, "adopting existing redirection session");
                Ok(session.handle().clone())
            }
            ExistingSessionPolicy::Reject => {
                Err(RedirectionError::AlreadyActive(endpoint_id.clone()))
            }
        }
    }

    pub async fn send(
        &self,
        endpoint_id: &EndpointId,
        data: impl Into<Bytes>,
    ) -> Result<(), RedirectionError> {
        let session = self.active(endpoint_id)?;
        match session.send(data.into()).await {
            Ok(len) => {
                counter!("redirection_bytes_sent_total", len as u64);
                Ok(())
            }
            Err(err) => Err(self.fail(&session, err).await),
        }
    }

    /// Waits for the next chunk of redirection traffic. Returns `Closed` if
    /// the session is closed while waiting.
    pub async fn receive(&self, endpoint_id: &EndpointId) -> Result<Bytes, RedirectionError> {
        let session = self.active(endpoint_id)?;
        match session.receive().await {
            Ok(data) => {
                counter!("redirection_bytes_received_total", data.len() as u64);
                Ok(data)
            }
            Err(err) => Err(self.fail(&session, err).await),
        }
    }

    /// Removes the registry entry and closes the channel. Unknown endpoints
    /// are a no-op.
    pub async fn close(&self, endpoint_id: &EndpointId) {
        match self.inner.registry.remove(endpoint_id) {
            Some(session) => {
                self.retire(&session, CloseReason::Explicit).await;
            }
            None => debug!(endpoint_id = %endpoint_id, "close for endpoint without a session"),
        }
    }

    pub fn lookup(&self, endpoint_id: &EndpointId) -> Option<SessionHandle> {
        self.inner
            .registry
            .lookup(endpoint_id)
            .map(|session| session.handle().clone())
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.snapshot()
    }

    /// Closes every session idle for at least the configured idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let now = now_millis();
        let idle_timeout = self.inner.config.idle_timeout;
        let mut reaped = 0usize;
        for session in self.inner.registry.sessions() {
            if session.idle_for(now) < idle_timeout {
                continue;
            }
            if self.retire(&session, CloseReason::Idle).await {
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_idle_reaper(&self) -> JoinHandle<()> {
        let service = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let reaped = service.reap_idle().await;
                if reaped > 0 {
                    info!(reaped, "closed idle redirection sessions");
                }
            }
        })
    }

    pub async fn close_all(&self) -> usize {
        let mut closed = 0usize;
        for session in self.inner.registry.sessions() {
            if self.retire(&session, CloseReason::Shutdown).await {
                closed += 1;
            }
        }
        closed
    }

    fn active(&self, endpoint_id: &EndpointId) -> Result<Arc<Session>, RedirectionError> {
        self.inner
            .registry
            .lookup(endpoint_id)
            .ok_or_else(|| RedirectionError::NotFound(endpoint_id.clone()))
    }

    async fn fail(&self, session: &Arc<Session>, err: SessionIoError) -> RedirectionError {
        let endpoint_id = session.endpoint_id().clone();
        match err {
            SessionIoError::Closed => {
                self.retire(session, CloseReason::Explicit).await;
                RedirectionError::Closed(endpoint_id)
            }
            SessionIoError::Transport(source) => {
                warn!(
                    endpoint_id = %endpoint_id,
                    session_id = %session.session_id(),
                    error = %source,
                    "transport failed mid-session"
                );
                self.retire(session, CloseReason::TransportError).await;
                RedirectionError::TransportFailed(source)
            }
        }
    }

    /// Drops `session` from the registry if it is still the registered one
    /// and closes it. Returns `true` only for the call that closed it.
    async fn retire(&self, session: &Arc<Session>, reason: CloseReason) -> bool {
        self.inner
            .registry
            .remove_if_current(session.endpoint_id(), session);
        if !session.close().await {
            return false;
        }
        counter!(
            "redirection_sessions_closed_total",
            1,
            "reason" => reason.as_str()
        );
        gauge!("redirection_sessions_active", self.inner.registry.len() as f64);
        info!(
            endpoint_id = %session.endpoint_id(),
            session_id = %session.session_id(),
            reason = reason.as_str(),
            "redirection session closed"
        );
        true
    }
}
