//! Peer channel over TCP: Hello handshake, then length-prefixed bincode frames carrying
//! queries and answers in both directions, multiplexed by query id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use overlay_core::wire::{answer_size, frame_len};
use overlay_core::{decode_frame, encode_frame, Answer, Frame, PublicKey, Query, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::{DisconnectHandler, PeerConnector, QueryHandler, RpcChannel, RpcError};

const LEN_SIZE: usize = 4;

/// Dials peers over TCP, presenting `local_key` in the handshake.
pub struct TcpConnector {
    local_key: PublicKey,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(local_key: PublicKey, connect_timeout: Duration) -> Self {
        Self {
            local_key,
            connect_timeout,
        }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        key: &PublicKey,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        let channel = TcpChannel::connect(addr, self.local_key, key, self.connect_timeout).await?;
        Ok(Arc::new(channel))
    }
}

type Waiter = oneshot::Sender<Result<Answer, RpcError>>;

struct ChannelInner {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_query_id: AtomicU64,
    handler: Mutex<Option<Arc<dyn QueryHandler>>>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    closed: CancellationToken,
}

impl ChannelInner {
    fn send(&self, frame: &Frame) -> Result<(), RpcError> {
        let bytes = encode_frame(frame).map_err(|e| RpcError::Io(e.to_string()))?;
        self.outbound.send(bytes).map_err(|_| RpcError::Closed)
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, query_id: u64, result: Result<Answer, RpcError>) {
        match self.waiters().remove(&query_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(query_id, "answer for unknown query"),
        }
    }

    async fn answer(&self, query_id: u64, max_answer_size: u64, query: Query) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let name = query.name();
        let result = match handler {
            Some(h) => h.handle(query).await,
            None => Err(RpcError::UnexpectedQuery(name)),
        };
        let frame = match result.and_then(|answer| {
            let size = answer_size(&answer).map_err(|e| RpcError::Io(e.to_string()))?;
            if size > max_answer_size {
                return Err(RpcError::AnswerTooLarge {
                    size,
                    limit: max_answer_size,
                });
            }
            Ok(answer)
        }) {
            Ok(answer) => Frame::Answer { query_id, answer },
            Err(e) => {
                debug!(query = name, error = %e, "query failed");
                Frame::Error {
                    query_id,
                    message: e.to_string(),
                }
            }
        };
        if self.send(&frame).is_err() {
            debug!(query_id, "channel closed before answer");
        }
    }

    /// Idempotent teardown: fail waiters, run the disconnect handler once.
    fn shutdown(&self) {
        self.closed.cancel();
        let waiters: Vec<Waiter> = self.waiters().drain().map(|(_, w)| w).collect();
        for w in waiters {
            let _ = w.send(Err(RpcError::Closed));
        }
        let handler = self
            .on_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handler {
            h();
        }
    }
}

/// Removes a waiter if the query future is dropped early.
struct WaiterGuard<'a> {
    inner: &'a ChannelInner,
    query_id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.waiters().remove(&self.query_id);
    }
}

pub struct TcpChannel {
    inner: Arc<ChannelInner>,
    remote_key: PublicKey,
}

impl TcpChannel {
    /// Dial `addr` and check the peer presents `expected`.
    pub async fn connect(
        addr: SocketAddr,
        local_key: PublicKey,
        expected: &PublicKey,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout)??;
        let channel = tokio::time::timeout(timeout, Self::establish(stream, local_key))
            .await
            .map_err(|_| RpcError::Timeout)??;
        if channel.remote_key != *expected {
            channel.close();
            return Err(RpcError::Handshake("peer presented a different key".into()));
        }
        debug!(%addr, "channel established");
        Ok(channel)
    }

    /// Serve an inbound connection.
    pub async fn accept(stream: TcpStream, local_key: PublicKey) -> Result<Self, RpcError> {
        Self::establish(stream, local_key).await
    }

    pub fn remote_key(&self) -> PublicKey {
        self.remote_key
    }

    async fn establish(stream: TcpStream, local_key: PublicKey) -> Result<Self, RpcError> {
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();
        let hello = encode_frame(&Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            public_key: local_key,
        })
        .map_err(|e| RpcError::Handshake(e.to_string()))?;
        wr.write_all(&hello).await?;
        let remote_key = match read_frame(&mut rd).await? {
            Frame::Hello {
                protocol_version,
                public_key,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(RpcError::Handshake(format!(
                        "protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                public_key
            }
            _ => return Err(RpcError::Handshake("expected hello".into())),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            outbound: tx,
            waiters: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
            handler: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_loop(wr, rx, inner.closed.clone()));
        tokio::spawn(read_loop(rd, inner.clone()));
        Ok(Self { inner, remote_key })
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[async_trait]
impl RpcChannel for TcpChannel {
    async fn query(&self, query: Query, max_answer_size: u64) -> Result<Answer, RpcError> {
        if self.inner.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let query_id = self.inner.next_query_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters().insert(query_id, tx);
        let _guard = WaiterGuard {
            inner: &self.inner,
            query_id,
        };
        self.inner.send(&Frame::Query {
            query_id,
            max_answer_size,
            query,
        })?;
        let answer = rx.await.unwrap_or(Err(RpcError::Closed))?;
        let size = answer_size(&answer).map_err(|e| RpcError::Io(e.to_string()))?;
        if size > max_answer_size {
            return Err(RpcError::AnswerTooLarge {
                size,
                limit: max_answer_size,
            });
        }
        Ok(answer)
    }

    fn set_query_handler(&self, handler: Arc<dyn QueryHandler>) {
        *self.inner.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        if self.inner.closed.is_cancelled() {
            handler();
            return;
        }
        *self
            .inner
            .on_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn close(&self) {
        self.inner.shutdown();
    }
}

async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Frame, RpcError> {
    let mut buf = vec![0u8; LEN_SIZE];
    rd.read_exact(&mut buf).await?;
    let len = frame_len(&buf).map_err(|e| RpcError::Io(e.to_string()))?;
    buf.resize(LEN_SIZE + len, 0);
    rd.read_exact(&mut buf[LEN_SIZE..]).await?;
    decode_frame(&buf)
        .map(|(frame, _)| frame)
        .map_err(|e| RpcError::Io(e.to_string()))
}

async fn read_loop(mut rd: OwnedReadHalf, inner: Arc<ChannelInner>) {
    loop {
        let frame = tokio::select! {
            _ = inner.closed.cancelled() => break,
            f = read_frame(&mut rd) => f,
        };
        match frame {
            Ok(Frame::Query {
                query_id,
                max_answer_size,
                query,
            }) => {
                let inner = inner.clone();
                tokio::spawn(async move { inner.answer(query_id, max_answer_size, query).await });
            }
            Ok(Frame::Answer { query_id, answer }) => inner.complete(query_id, Ok(answer)),
            Ok(Frame::Error { query_id, message }) => {
                inner.complete(query_id, Err(RpcError::Remote(message)))
            }
            Ok(Frame::Hello { .. }) => {
                warn!("hello after handshake");
                break;
            }
            Err(e) => {
                debug!(error = %e, "channel read ended");
                break;
            }
        }
    }
    inner.shutdown();
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => None,
            msg = rx.recv() => msg,
        };
        let Some(bytes) = next else {
            break;
        };
        if let Err(e) = wr.write_all(&bytes).await {
            debug!(error = %e, "channel write failed");
            break;
        }
    }
    closed.cancel();
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_core::protocol::{Capabilities, GetCapabilities};
    use tokio::net::TcpListener;

    struct Caps(i64);

    #[async_trait]
    impl QueryHandler for Caps {
        async fn handle(&self, query: Query) -> Result<Answer, RpcError> {
            match query {
                Query::GetCapabilities(_) => Ok(Answer::Capabilities(Capabilities { value: self.0 })),
                other => Err(RpcError::UnexpectedQuery(other.name())),
            }
        }
    }

    fn caps() -> Query {
        Query::GetCapabilities(GetCapabilities { capabilities: 0 })
    }

    async fn pair() -> (TcpChannel, TcpChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpChannel::accept(stream, PublicKey([2; 32])).await.unwrap()
        });
        let client = TcpChannel::connect(
            addr,
            PublicKey([1; 32]),
            &PublicKey([2; 32]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn queries_flow_both_ways() {
        let (client, server) = pair().await;
        assert_eq!(server.remote_key(), PublicKey([1; 32]));
        server.set_query_handler(Arc::new(Caps(7)));
        client.set_query_handler(Arc::new(Caps(9)));

        let a = client.query(caps(), 1024).await.unwrap();
        assert_eq!(a, Answer::Capabilities(Capabilities { value: 7 }));
        let b = server.query(caps(), 1024).await.unwrap();
        assert_eq!(b, Answer::Capabilities(Capabilities { value: 9 }));
    }

    #[tokio::test]
    async fn handler_error_reaches_asker() {
        let (client, _server) = pair().await;
        // No handler registered on the server.
        let err = client.query(caps(), 1024).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
    }

    #[tokio::test]
    async fn oversized_answer_is_refused() {
        let (client, server) = pair().await;
        server.set_query_handler(Arc::new(Caps(7)));
        let err = client.query(caps(), 1).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("exceeds limit")));
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _channel = TcpChannel::accept(stream, PublicKey([3; 32])).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let err = TcpChannel::connect(
            addr,
            PublicKey([1; 32]),
            &PublicKey([2; 32]),
            Duration::from_secs(5),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, RpcError::Handshake(_)));
    }

    #[tokio::test]
    async fn remote_close_fires_disconnect_and_fails_queries() {
        let (client, server) = pair().await;
        let (tx, rx) = oneshot::channel();
        client.set_disconnect_handler(Box::new(move || {
            let _ = tx.send(());
        }));
        server.close();
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.query(caps(), 1024).await, Err(RpcError::Closed));
    }

    #[tokio::test]
    async fn connector_produces_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = TcpChannel::accept(stream, PublicKey([5; 32])).await.unwrap();
            channel.set_query_handler(Arc::new(Caps(1)));
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let connector = TcpConnector::new(PublicKey([1; 32]), Duration::from_secs(5));
        let channel = connector.connect(addr, &PublicKey([5; 32])).await.unwrap();
        assert_eq!(
            channel.query(caps(), 1024).await.unwrap(),
            Answer::Capabilities(Capabilities { value: 1 })
        );
    }
}
