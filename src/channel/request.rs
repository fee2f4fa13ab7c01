//! Singleton request channel: one chunked request, one chunked reply.
//!
//! ```text
//! client                                   server
//!   │── preamble (Mode=Singleton) ───────────►│
//!   │◄─────────────────────────── PreambleAck │
//!   │── UnsizedEnvelope {chunk}* 0x00 End ───►│
//!   │◄─── UnsizedEnvelope {chunk}* 0x00 End ──│
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::singleton_io::{ChunkedReader, ChunkedWriter};
use super::ChannelCore;
use crate::codec::MessageCodec;
use crate::error::Result;
use crate::pool::PooledConnection;
use crate::protocol::ClientSingletonDecoder;
use crate::timeout::TimeoutHelper;

/// Sends requests as independent singleton exchanges.
///
/// Each request takes its own connection, so one channel may be used for
/// several requests in turn.
pub struct SingletonRequestChannel<C: MessageCodec> {
    core: Arc<ChannelCore<C>>,
}

impl<C: MessageCodec> SingletonRequestChannel<C> {
    pub(crate) fn new(core: Arc<ChannelCore<C>>) -> Self {
        Self { core }
    }

    /// Send `message` and wait for the reply within the send timeout.
    pub async fn request(&self, message: &C::Message) -> Result<C::Message> {
        self.request_with_timeout(message, self.core.settings.send_timeout)
            .await
    }

    /// Send `message` and wait for the reply; `timeout` covers connecting,
    /// the preamble, the request and the whole reply.
    pub async fn request_with_timeout(
        &self,
        message: &C::Message,
        timeout: Duration,
    ) -> Result<C::Message> {
        let body = self.core.codec.encode(message)?;
        let helper = TimeoutHelper::new(timeout);
        let (connection, mut decoder) = self
            .core
            .establish(&self.core.singleton_preamble, ClientSingletonDecoder::new, &helper)
            .await?;

        let result = self.exchange(&connection, &body, &mut decoder, &helper).await;
        let (reply, reusable) = match result {
            Ok((reply, leftover)) => (Ok(reply), leftover == 0),
            Err(e) => {
                tracing::debug!(via = %self.core.via, connection = connection.id(), error = %e, "singleton exchange failed");
                (Err(e), false)
            }
        };
        self.core
            .pool
            .return_connection(&self.core.pool_key, connection, reusable, helper.remaining_or_zero())
            .await;

        self.core.codec.decode(reply?)
    }

    /// Returns the reply body and how many bytes were read past its end.
    async fn exchange(
        &self,
        connection: &PooledConnection,
        body: &[u8],
        decoder: &mut ClientSingletonDecoder,
        helper: &TimeoutHelper,
    ) -> Result<(Bytes, usize)> {
        let settings = &self.core.settings;
        let mut writer = ChunkedWriter::begin(&**connection, settings.connection_buffer_size);
        writer.write(body, helper).await?;
        writer.finish(helper).await?;

        let mut reader = ChunkedReader::new(
            &**connection,
            settings.connection_buffer_size,
            settings.max_received_message_size,
        );
        let reply = reader.read_reply(decoder, helper).await?;
        Ok((reply, reader.leftover()))
    }
}

impl<C: MessageCodec> Clone for SingletonRequestChannel<C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for SingletonRequestChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonRequestChannel")
            .field("via", &self.core.via)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    use crate::channel::{ChannelBuilder, ChannelFactory};
    use crate::codec::{MsgPackCodec, RawCodec};
    use crate::error::{ErrorCategory, FramingError};
    use crate::protocol::{encode_chunk, encode_string, faults, CHUNK_TERMINATOR};
    use crate::transport::{BoxedConnection, Connector, StreamConnection};
    use crate::via::Via;

    struct MemoryConnector {
        servers: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _via: &Via, _timeout: Duration) -> Result<BoxedConnection> {
            let (client, server) = tokio::io::duplex(4096);
            self.servers
                .send(server)
                .map_err(|_| FramingError::CommunicationFailed("test server gone".into()))?;
            Ok(Box::new(StreamConnection::new(client)))
        }
    }

    fn factory<C: MessageCodec>(codec: C) -> (ChannelFactory<C>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = ChannelBuilder::new("net.tcp://host:808/svc", codec)
            .connector(Arc::new(MemoryConnector { servers: tx }))
            .send_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        (factory, rx)
    }

    async fn read_until(server: &mut DuplexStream, last: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            let byte = server.read_u8().await.unwrap();
            bytes.push(byte);
            if byte == last {
                return bytes;
            }
        }
    }

    /// Read a chunked request body after the UnsizedEnvelope tag.
    async fn read_request(server: &mut DuplexStream) -> Vec<u8> {
        assert_eq!(server.read_u8().await.unwrap(), 0x05);
        let mut body = Vec::new();
        loop {
            // Test bodies are small enough for one-byte varints.
            let size = server.read_u8().await.unwrap() as usize;
            if size == 0 {
                break;
            }
            let mut chunk = vec![0u8; size];
            server.read_exact(&mut chunk).await.unwrap();
            body.extend_from_slice(&chunk);
        }
        assert_eq!(server.read_u8().await.unwrap(), 0x07);
        body
    }

    fn reply(body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x05]);
        encode_chunk(body, &mut buf).unwrap();
        buf.extend_from_slice(&CHUNK_TERMINATOR);
        buf.extend_from_slice(&[0x07]);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (factory, mut servers) = factory(RawCodec);
        let channel = factory.request_channel();

        let server = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            let preamble = read_until(&mut server, 0x0C).await;
            assert_eq!(preamble[3..5], [0x01, 0x01]);
            server.write_all(&[0x0B]).await.unwrap();
            assert_eq!(read_request(&mut server).await, b"ping");
            server.write_all(&reply(b"pong")).await.unwrap();
            server
        });

        let answer = channel.request(&Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&answer[..], b"pong");
        let _server = server.await.unwrap();
        assert_eq!(factory.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn test_pooled_connection_is_reused() {
        let (factory, mut servers) = factory(MsgPackCodec::<String>::new());
        let channel = factory.request_channel();

        let server = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            for _ in 0..2 {
                read_until(&mut server, 0x0C).await;
                server.write_all(&[0x0B]).await.unwrap();
                let request = read_request(&mut server).await;
                let text: String = rmp_serde::from_slice(&request).unwrap();
                let answer = rmp_serde::to_vec_named(&text.to_uppercase()).unwrap();
                server.write_all(&reply(&answer)).await.unwrap();
            }
            (server, servers)
        });

        assert_eq!(channel.request(&"one".to_string()).await.unwrap(), "ONE");
        assert_eq!(channel.request(&"two".to_string()).await.unwrap(), "TWO");
        let (_server, mut servers) = server.await.unwrap();
        // Both requests went over the first connection.
        assert!(servers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fault_reply_discards_connection() {
        let (factory, mut servers) = factory(RawCodec);
        let channel = factory.request_channel();

        let server = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            read_until(&mut server, 0x0C).await;
            server.write_all(&[0x0B]).await.unwrap();
            read_request(&mut server).await;
            let mut fault = BytesMut::from(&[0x08][..]);
            encode_string(faults::SERVICE_ACTIVATION_FAILED, &mut fault).unwrap();
            fault.extend_from_slice(&[0x07]);
            server.write_all(&fault).await.unwrap();
            server
        });

        let err = channel.request(&Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ServiceActivation);
        let _server = server.await.unwrap();
        assert_eq!(factory.pool().idle_count(), 0);
        assert_eq!(factory.pool().busy_count(), 0);
    }

    #[tokio::test]
    async fn test_preamble_fault() {
        let (factory, mut servers) = factory(RawCodec);
        let channel = factory.request_channel();

        let server = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            read_until(&mut server, 0x0C).await;
            let mut fault = BytesMut::from(&[0x08][..]);
            encode_string(faults::ENDPOINT_NOT_FOUND, &mut fault).unwrap();
            fault.extend_from_slice(&[0x07]);
            server.write_all(&fault).await.unwrap();
            server
        });

        let err = channel.request(&Bytes::new()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::EndpointNotFound);
        let _server = server.await.unwrap();
        assert_eq!(factory.pool().busy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (factory, mut servers) = factory(RawCodec);
        let channel = factory.request_channel();
        let server = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            read_until(&mut server, 0x0C).await;
            server
        });

        let err = channel
            .request_with_timeout(&Bytes::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
        let _server = server.await.unwrap();
    }
}
