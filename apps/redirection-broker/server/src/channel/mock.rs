//! Scripted channel and connector for exercising the negotiator and the
//! facade without a real management controller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use redirection_core::{
    AuthChallenge, AuthStatus, AuthType, ConnectionParameters, EndpointId, HandshakeMessage,
    StartStatus,
};
use tokio::sync::mpsc;

use super::{ChannelConnector, ChannelError, TransportChannel};

enum ScriptStep {
    Data(Bytes),
    Fail,
    Hang,
}

/// Channel that replays queued inbound steps and records every send.
///
/// `receive` blocks once the script is exhausted, until more steps are
/// pushed or the channel is closed.
pub struct ScriptedChannel {
    inbound_tx: mpsc::UnboundedSender<ScriptStep>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptStep>>,
    sent: parking_lot::Mutex<Vec<Bytes>>,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    closed: AtomicBool,
    fail_connect: AtomicBool,
    fail_sends: AtomicBool,
    connect_delay: parking_lot::Mutex<Option<Duration>>,
}

impl Default for ScriptedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChannel {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: parking_lot::Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            connect_delay: parking_lot::Mutex::new(None),
        }
    }

    /// An endpoint that starts the session and accepts the first
    /// authentication attempt.
    pub fn accepting() -> Self {
        Self::new()
            .with_reply(HandshakeMessage::start_reply(StartStatus::Success))
            .with_reply(HandshakeMessage::auth_reply(AuthStatus::Success, AuthType::Query))
    }

    pub fn with_reply(self, message: HandshakeMessage) -> Self {
        self.push_reply(message);
        self
    }

    pub fn with_challenge(
        self,
        status: AuthStatus,
        auth_type: AuthType,
        challenge: AuthChallenge,
    ) -> Self {
        self.with_reply(HandshakeMessage::AuthenticateSessionReply {
            status,
            auth_type,
            challenge,
        })
    }

    pub fn with_data(self, data: impl Into<Bytes>) -> Self {
        self.push_data(data);
        self
    }

    pub fn with_receive_failure(self) -> Self {
        self.push_receive_failure();
        self
    }

    /// Queues a receive that never completes.
    pub fn with_hang(self) -> Self {
        let _ = self.inbound_tx.send(ScriptStep::Hang);
        self
    }

    pub fn with_connect_failure(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock() = Some(delay);
        self
    }

    pub fn push_reply(&self, message: HandshakeMessage) {
        match message.encode() {
            Ok(bytes) => self.push_data(bytes),
            Err(err) => panic!("scripted reply does not encode: {err}"),
        }
    }

    pub fn push_data(&self, data: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(ScriptStep::Data(data.into()));
    }

    pub fn push_receive_failure(&self) {
        let _ = self.inbound_tx.send(ScriptStep::Fail);
    }

    /// Makes every later `send` fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Handshake messages among the recorded sends, in order.
    pub fn sent_messages(&self) -> Vec<HandshakeMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| {
                let mut buf = BytesMut::from(&frame[..]);
                HandshakeMessage::decode(&mut buf).ok().flatten()
            })
            .collect()
    }

    /// Authentication types attempted, in order.
    pub fn auth_attempts(&self) -> Vec<AuthType> {
        self.sent_messages()
            .into_iter()
            .filter_map(|message| match message {
                HandshakeMessage::AuthenticateSession(request) => Some(request.auth_type()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportChannel for ScriptedChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect {
                target: "scripted".into(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "scripted connect failure",
                ),
            });
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted send failure",
            )));
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut inbound = self.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(ScriptStep::Data(bytes)) => Ok(bytes),
            Some(ScriptStep::Fail) => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "scripted receive failure",
            ))),
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Err(ChannelError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

type ChannelFactory = dyn Fn(&EndpointId) -> ScriptedChannel + Send + Sync;

/// Connector handing out scripted channels and remembering each one.
pub struct ScriptedConnector {
    factory: Box<ChannelFactory>,
    issued: parking_lot::Mutex<Vec<(EndpointId, Arc<ScriptedChannel>)>>,
}

impl ScriptedConnector {
    pub fn new(factory: impl Fn(&EndpointId) -> ScriptedChannel + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            issued: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(|_| ScriptedChannel::accepting())
    }

    pub fn issued(&self) -> Vec<Arc<ScriptedChannel>> {
        self.issued
            .lock()
            .iter()
            .map(|(_, channel)| Arc::clone(channel))
            .collect()
    }

    pub fn issued_for(&self, endpoint_id: &EndpointId) -> Vec<Arc<ScriptedChannel>> {
        self.issued
            .lock()
            .iter()
            .filter(|(id, _)| id == endpoint_id)
            .map(|(_, channel)| Arc::clone(channel))
            .collect()
    }

    pub fn last_for(&self, endpoint_id: &EndpointId) -> Option<Arc<ScriptedChannel>> {
        self.issued_for(endpoint_id).pop()
    }
}

impl ChannelConnector for ScriptedConnector {
    fn channel(
        &self,
        endpoint_id: &EndpointId,
        _params: &ConnectionParameters,
    ) -> Arc<dyn TransportChannel> {
        let channel = Arc::new((self.factory)(endpoint_id));
        self.issued
            .lock()
            .push((endpoint_id.clone(), Arc::clone(&channel)));
        channel
    }
}
