//! Bounded byte pipe between one producer task and one consumer.
//!
//! Bodies flow through it in both directions: upstream response payloads and assembled
//! pieces toward the HTTP client, request bodies toward a peer pulling payload parts.
//! A full buffer blocks the writer; dropping either half without finishing aborts the other.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

/// Default bound on buffered bytes per stream.
pub const DEFAULT_STREAM_BUFFER: usize = 1 << 20; // 1 MiB

/// The other side went away, or the stream was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream closed")]
pub struct StreamClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// No more writes; readers drain what is buffered, then see end-of-data.
    Finished,
    /// Aborted. Buffered bytes are dropped.
    Closed,
}

struct State {
    buf: BytesMut,
    phase: Phase,
}

struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    limit: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn abort(&self) {
        {
            let mut st = self.lock();
            if st.phase == Phase::Closed {
                return;
            }
            st.phase = Phase::Closed;
            st.buf.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Producer half.
pub struct StreamWriter {
    shared: Arc<Shared>,
}

/// Consumer half. This is the body type handed around by the gateway.
pub struct DataStream {
    shared: Arc<Shared>,
}

impl DataStream {
    /// New pipe holding at most `limit` buffered bytes before writes block.
    pub fn new(limit: usize) -> (StreamWriter, DataStream) {
        Self::with_capacity(limit, 0)
    }

    /// Like `new`, with an initial allocation of `capacity` bytes.
    pub fn with_capacity(limit: usize, capacity: usize) -> (StreamWriter, DataStream) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buf: BytesMut::with_capacity(capacity),
                phase: Phase::Open,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            limit: limit.max(1),
        });
        (
            StreamWriter {
                shared: shared.clone(),
            },
            DataStream { shared },
        )
    }

    /// A stream that is already at end-of-data.
    pub fn empty() -> Self {
        Self::from_bytes(&[])
    }

    /// A finished stream holding `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let (writer, reader) = Self::with_capacity(data.len().max(1), data.len());
        writer.shared.lock().buf.extend_from_slice(data);
        writer.finish();
        reader
    }

    /// Next buffered chunk of at most `max` bytes. `None` is end-of-data.
    pub async fn next_chunk(&mut self, max: usize) -> Result<Option<Bytes>, StreamClosed> {
        let max = max.max(1);
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut st = self.shared.lock();
                if st.phase == Phase::Closed {
                    return Err(StreamClosed);
                }
                if !st.buf.is_empty() {
                    let n = st.buf.len().min(max);
                    let chunk = st.buf.split_to(n).freeze();
                    drop(st);
                    self.shared.writable.notify_waiters();
                    return Ok(Some(chunk));
                }
                if st.phase == Phase::Finished {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Copy into `out`. Returns 0 at end-of-data.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, StreamClosed> {
        if out.is_empty() {
            return Ok(0);
        }
        match self.next_chunk(out.len()).await? {
            Some(chunk) => {
                out[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    /// Gather up to `max` bytes, waiting until that many arrived or the writer finished.
    /// The flag is true when end-of-data was reached.
    pub async fn read_up_to(&mut self, max: usize) -> Result<(Bytes, bool), StreamClosed> {
        let mut acc = BytesMut::new();
        while acc.len() < max {
            match self.next_chunk(max - acc.len()).await? {
                Some(chunk) => acc.extend_from_slice(&chunk),
                None => return Ok((acc.freeze(), true)),
            }
        }
        Ok((acc.freeze(), false))
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StreamClosed> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk(64 * 1024).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Abort: the writer's next write fails.
    pub fn close(&self) {
        self.shared.abort();
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        self.shared.abort();
    }
}

impl StreamWriter {
    /// Append `data`, waiting while the buffer is at its bound.
    pub async fn write(&self, data: &[u8]) -> Result<(), StreamClosed> {
        loop {
            let notified = self.shared.writable.notified();
            {
                let mut st = self.shared.lock();
                if st.phase != Phase::Open {
                    return Err(StreamClosed);
                }
                if st.buf.len() < self.shared.limit {
                    st.buf.extend_from_slice(data);
                    drop(st);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Mark end-of-data. The reader sees it after draining the buffer.
    pub fn finish(self) {
        {
            let mut st = self.shared.lock();
            if st.phase == Phase::Open {
                st.phase = Phase::Finished;
            }
        }
        self.shared.readable.notify_waiters();
    }

    /// Abort: the reader's next read fails.
    pub fn close(&self) {
        self.shared.abort();
    }

    /// Whether the reader is gone or the stream was aborted.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().phase == Phase::Closed
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.shared.lock().phase == Phase::Open {
            self.shared.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bytes_arrive_in_order_then_end() {
        let (w, mut r) = DataStream::new(1024);
        let producer = tokio::spawn(async move {
            for i in 0..10u8 {
                w.write(&[i; 100]).await.unwrap();
            }
            w.finish();
        });
        let body = r.read_to_end().await.unwrap();
        producer.await.unwrap();
        assert_eq!(body.len(), 1000);
        assert!(body
            .chunks(100)
            .enumerate()
            .all(|(i, c)| c.iter().all(|b| *b == i as u8)));
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_blocks_writer() {
        let (w, mut r) = DataStream::new(8);
        w.write(&[1; 8]).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), w.write(&[2; 4])).await;
        assert!(blocked.is_err());

        let first = r.next_chunk(8).await.unwrap().unwrap();
        assert_eq!(&first[..], &[1; 8]);
        w.write(&[2; 4]).await.unwrap();
        assert_eq!(&r.next_chunk(8).await.unwrap().unwrap()[..], &[2; 4]);
    }

    #[tokio::test]
    async fn reader_close_fails_writer() {
        let (w, r) = DataStream::new(8);
        r.close();
        assert_eq!(w.write(b"x").await, Err(StreamClosed));
        assert!(w.is_closed());
    }

    #[tokio::test]
    async fn dropped_reader_unblocks_waiting_writer() {
        let (w, r) = DataStream::new(4);
        w.write(&[0; 4]).await.unwrap();
        let pending = tokio::spawn(async move { w.write(&[0; 4]).await });
        tokio::task::yield_now().await;
        drop(r);
        assert_eq!(pending.await.unwrap(), Err(StreamClosed));
    }

    #[tokio::test]
    async fn writer_dropped_without_finish_is_an_error() {
        let (w, mut r) = DataStream::new(64);
        w.write(b"partial").await.unwrap();
        drop(w);
        assert_eq!(r.read_to_end().await, Err(StreamClosed));
    }

    #[tokio::test]
    async fn finished_stream_drains_before_end() {
        let (w, mut r) = DataStream::new(64);
        w.write(b"hello ").await.unwrap();
        w.write(b"world").await.unwrap();
        w.finish();
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"hell");
        assert_eq!(r.read_to_end().await.unwrap(), b"o world");
        assert_eq!(r.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_up_to_reports_end() {
        let mut r = DataStream::from_bytes(b"0123456789");
        let (a, eof) = r.read_up_to(4).await.unwrap();
        assert_eq!((&a[..], eof), (&b"0123"[..], false));
        let (b, eof) = r.read_up_to(100).await.unwrap();
        assert_eq!((&b[..], eof), (&b"456789"[..], true));
        let (c, eof) = r.read_up_to(4).await.unwrap();
        assert!(c.is_empty() && eof);
    }

    #[tokio::test]
    async fn empty_stream_is_at_end() {
        let mut r = DataStream::empty();
        assert_eq!(r.next_chunk(10).await.unwrap(), None);
    }
}
