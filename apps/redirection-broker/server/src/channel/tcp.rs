use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use redirection_core::{ConnectionParameters, EndpointId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ChannelConnector, ChannelError, TransportChannel};

const READ_CHUNK: usize = 16 * 1024;

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type BoxedStream = Box<dyn IoStream>;

/// Plain TCP or TLS channel to a management controller.
pub struct TcpChannel {
    params: ConnectionParameters,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
}

impl TcpChannel {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.params.address, self.params.effective_port())
    }

    async fn wrap_tls(&self, tcp: TcpStream) -> Result<BoxedStream, ChannelError> {
        let target = self.target();
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.params.allow_self_signed)
            .danger_accept_invalid_hostnames(self.params.allow_self_signed)
            .build()
            .map_err(|err| ChannelError::Tls {
                target: target.clone(),
                reason: err.to_string(),
            })?;
        let stream = tokio_native_tls::TlsConnector::from(connector)
            .connect(&self.params.address, tcp)
            .await
            .map_err(|err| ChannelError::Tls {
                target,
                reason: err.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl TransportChannel for TcpChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let tcp = TcpStream::connect((self.params.address.as_str(), self.params.effective_port()))
            .await
            .map_err(|source| ChannelError::Connect {
                target: self.target(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let stream: BoxedStream = if self.params.use_tls {
            self.wrap_tls(tcp).await?
        } else {
            Box::new(tcp)
        };
        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);

        debug!(
            target_addr = %self.target(),
            tls = self.params.use_tls,
            "transport channel connected"
        );
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, ChannelError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(ChannelError::Closed);
        }
        Ok(buf.freeze())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl ChannelConnector for TcpConnector {
    fn channel(
        &self,
        _endpoint_id: &EndpointId,
        params: &ConnectionParameters,
    ) -> Arc<dyn TransportChannel> {
        Arc::new(TcpChannel::new(params.clone()))
    }
}
