use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use redirection_core::{AuthType, EndpointId, ProtocolVersion, RedirectionKind};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::channel::{ChannelError, TransportChannel};
use crate::negotiator::Negotiated;

/// Caller-facing description of an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub endpoint_id: EndpointId,
    pub session_id: Uuid,
    pub kind: RedirectionKind,
    pub auth_type: AuthType,
    pub protocol_version: ProtocolVersion,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub handle: SessionHandle,
    pub last_activity_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Error)]
pub enum SessionIoError {
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] ChannelError),
}

/// One authenticated redirection session.
///
/// Sends are serialised on one lane and receives on another, so each
/// direction keeps the order in which callers issued it. Shutdown wakes every
/// call parked on either lane or on the channel.
pub struct Session {
    handle: SessionHandle,
    channel: Arc<dyn TransportChannel>,
    last_activity: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    inbound: Mutex<BytesMut>,
    outbound: Mutex<()>,
}

impl Session {
    pub fn new(
        endpoint_id: EndpointId,
        kind: RedirectionKind,
        negotiated: Negotiated,
        channel: Arc<dyn TransportChannel>,
    ) -> Self {
        let now = now_millis();
        let (shutdown, _) = watch::channel(false);
        Self {
            handle: SessionHandle {
                endpoint_id,
                session_id: Uuid::new_v4(),
                kind,
                auth_type: negotiated.auth_type,
                protocol_version: negotiated.version,
                created_at_ms: now,
            },
            channel,
            last_activity: AtomicU64::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown,
            inbound: Mutex::new(negotiated.leftover),
            outbound: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.handle.endpoint_id
    }

    pub fn session_id(&self) -> Uuid {
        self.handle.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            handle: self.handle.clone(),
            last_activity_ms: self.last_activity.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn idle_for(&self, now_ms: u64) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    pub async fn send(&self, data: Bytes) -> Result<usize, SessionIoError> {
        let len = data.len();
        let result = tokio::select! {
            biased;
            _ = self.closed_signal() => Err(SessionIoError::Closed),
            result = async move {
                let _lane = self.outbound.lock().await;
                self.ensure_open()?;
                self.channel.send(data).await.map_err(SessionIoError::from)
            } => result,
        };
        result?;
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.touch();
        Ok(len)
    }

    pub async fn receive(&self) -> Result<Bytes, SessionIoError> {
        let data = tokio::select! {
            biased;
            _ = self.closed_signal() => Err(SessionIoError::Closed),
            result = async move {
                let mut pending = self.inbound.lock().await;
                self.ensure_open()?;
                if !pending.is_empty() {
                    return Ok(pending.split().freeze());
                }
                self.channel.receive().await.map_err(SessionIoError::from)
            } => result,
        }?;
        self.bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.touch();
        Ok(data)
    }

    /// Marks the session closed and wakes in-flight calls. Returns `true` for
    /// exactly one caller; that caller owns closing the channel.
    pub fn begin_shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.send_replace(true);
        true
    }

    /// Shuts the session down and closes its channel, once.
    pub async fn close(&self) -> bool {
        if !self.begin_shutdown() {
            return false;
        }
        self.channel.close().await;
        true
    }

    fn ensure_open(&self) -> Result<(), SessionIoError> {
        if self.is_closed() {
            Err(SessionIoError::Closed)
        } else {
            Ok(())
        }
    }

    async fn closed_signal(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::ScriptedChannel;

    fn session_over(channel: Arc<ScriptedChannel>, leftover: &[u8]) -> Session {
        let negotiated = Negotiated {
            auth_type: AuthType::Digest,
            version: ProtocolVersion::default(),
            rejected: Vec::new(),
            leftover: BytesMut::from(leftover),
        };
        Session::new("dev-1".into(), RedirectionKind::Kvm, negotiated, channel)
    }

    #[test_timeout::tokio_timeout_test]
    async fn leftover_handshake_bytes_come_first() {
        let channel = Arc::new(ScriptedChannel::new().with_data(&b"second"[..]));
        let session = session_over(Arc::clone(&channel), b"first");

        assert_eq!(&session.receive().await.unwrap()[..], b"first");
        assert_eq!(&session.receive().await.unwrap()[..], b"second");
        assert_eq!(session.snapshot().bytes_received, 11);
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_forwards_and_counts() {
        let channel = Arc::new(ScriptedChannel::new());
        let session = session_over(Arc::clone(&channel), b"");

        assert_eq!(session.send(Bytes::from_static(b"ls\r")).await.unwrap(), 3);
        assert_eq!(channel.sent_frames(), vec![Bytes::from_static(b"ls\r")]);
        assert_eq!(session.snapshot().bytes_sent, 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_runs_once_and_wakes_blocked_receive() {
        let channel = Arc::new(ScriptedChannel::new());
        let session = Arc::new(session_over(Arc::clone(&channel), b""));

        let reader = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.receive().await })
        };
        tokio::task::yield_now().await;

        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(matches!(reader.await.unwrap(), Err(SessionIoError::Closed)));
        assert_eq!(channel.close_calls(), 1);
        assert!(matches!(
            session.send(Bytes::from_static(b"x")).await,
            Err(SessionIoError::Closed)
        ));
    }

    #[test_timeout::timeout]
    fn snapshot_serialises_flat() {
        let session = session_over(Arc::new(ScriptedChannel::new()), b"");
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["endpoint_id"], "dev-1");
        assert_eq!(json["auth_type"], "digest");
        assert!(json.get("last_activity_ms").is_some());
    }

    #[test_timeout::timeout]
    fn idle_time_is_measured_from_last_activity() {
        let session = session_over(Arc::new(ScriptedChannel::new()), b"");
        let last = session.snapshot().last_activity_ms;
        assert_eq!(session.idle_for(last + 1_500), Duration::from_millis(1_500));
        assert_eq!(session.idle_for(0), Duration::ZERO);
    }
}
