//! Response writing and tracking.
//!
//! Handlers do not return a response value. They receive a [`ResponseWriter`]
//! and write into it, the way a streaming server would let them:
//!
//! ```text
//! handler ──write──▶ ResponseWriter ──▶ Sink ──buffer──▶ hyper (Full body)
//!                     (status, bytes)        └─flush──▶ hyper (streamed body)
//! ```
//!
//! The [`Sink`] buffers everything until the handler returns and then hands
//! hyper a single `Full` body. Calling [`Sink::flush`] (or
//! [`Sink::copy_from`]) commits the head early and switches the response to a
//! streamed body fed through a bounded channel.
//!
//! [`ResponseWriter`] is the one tracking shape around a sink. It records the
//! status and byte count for the request logger. Anything beyond the tracked
//! surface is reached through [`ResponseWriter::get_ref`].

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// The body type of every response the server sends.
pub type Body = UnsyncBoxBody<Bytes, Infallible>;

/// Chunks in flight between a streaming handler and hyper.
const STREAM_DEPTH: usize = 16;

const COPY_CHUNK: usize = 8 * 1024;

// ── Sink ──────────────────────────────────────────────────────────────────────

enum Output {
    /// Head not sent yet. Everything written so far sits in the buffer.
    Pending(oneshot::Sender<http::Response<Body>>),
    /// Head sent, body streaming.
    Streaming(mpsc::Sender<Bytes>),
    /// Response finished or the client went away.
    Closed,
}

struct SinkState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    buf: BytesMut,
    out: Output,
}

impl SinkState {
    fn head(&mut self, body: Body) -> http::Response<Body> {
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = std::mem::take(&mut self.headers);
        response
    }

    /// Sends the head with a streamed body if it has not been sent yet.
    fn stream(&mut self) -> Option<mpsc::Sender<Bytes>> {
        match std::mem::replace(&mut self.out, Output::Closed) {
            Output::Pending(head) => {
                let (tx, rx) = mpsc::channel(STREAM_DEPTH);
                let body = StreamBody::new(
                    ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
                );
                if head.send(self.head(BodyExt::boxed_unsync(body))).is_err() {
                    return None;
                }
                self.out = Output::Streaming(tx.clone());
                Some(tx)
            }
            Output::Streaming(tx) => {
                self.out = Output::Streaming(tx.clone());
                Some(tx)
            }
            Output::Closed => None,
        }
    }
}

/// The raw outbound stream of one response.
///
/// Cloning a `Sink` yields another handle to the same response.
#[derive(Clone)]
pub struct Sink {
    state: Arc<Mutex<SinkState>>,
}

impl Sink {
    /// Creates a sink and the receiver that resolves once its head is ready.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<http::Response<Body>>) {
        let (head_tx, head_rx) = oneshot::channel();
        let state = SinkState {
            status: None,
            headers: HeaderMap::new(),
            buf: BytesMut::new(),
            out: Output::Pending(head_tx),
        };
        (Self { state: Arc::new(Mutex::new(state)) }, head_rx)
    }

    /// Mutable access to the response headers. Changes made after the head
    /// has been sent are ignored.
    pub fn headers_mut(&self) -> MappedMutexGuard<'_, HeaderMap> {
        MutexGuard::map(self.state.lock(), |s| &mut s.headers)
    }

    /// Sets the status. Only the first call has any effect.
    pub fn write_header(&self, status: StatusCode) {
        let mut state = self.state.lock();
        if state.status.is_none() {
            state.status = Some(status);
        }
    }

    /// Appends `buf` to the response body.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if matches!(state.out, Output::Closed) {
            return Err(closed());
        }
        state.status.get_or_insert(StatusCode::OK);
        state.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Whether the head has already been handed to the server.
    pub fn is_streaming(&self) -> bool {
        matches!(self.state.lock().out, Output::Streaming(_))
    }

    /// Sends the head and everything buffered so far to the client.
    pub async fn flush(&self) -> io::Result<()> {
        let (tx, chunk) = {
            let mut state = self.state.lock();
            let tx = state.stream().ok_or_else(closed)?;
            (tx, state.buf.split().freeze())
        };
        if !chunk.is_empty() {
            tx.send(chunk).await.map_err(|_| closed())?;
        }
        Ok(())
    }

    /// Streams `reader` to the client until EOF, returning the bytes copied.
    pub async fn copy_from<R>(&self, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.copy_chunks(reader, |_| ()).await
    }

    /// Like [`copy_from`](Sink::copy_from), reporting every chunk handed to
    /// the client as it goes. Chunks sent before a read error are reported.
    async fn copy_chunks<R, F>(&self, mut reader: R, mut sent: F) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        F: FnMut(usize),
    {
        self.flush().await?;
        let tx = self.state.lock().stream().ok_or_else(closed)?;

        let mut total = 0u64;
        loop {
            let mut chunk = BytesMut::with_capacity(COPY_CHUNK);
            let n = reader.read_buf(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            tx.send(chunk.freeze()).await.map_err(|_| closed())?;
            sent(n);
            total += n as u64;
        }
    }

    /// Completes the response. Later writes fail with `BrokenPipe`.
    pub(crate) async fn finish(&self) {
        let (tx, chunk) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.out, Output::Closed) {
                Output::Pending(head) => {
                    let body = Full::new(state.buf.split().freeze());
                    let _ = head.send(state.head(BodyExt::boxed_unsync(body)));
                    return;
                }
                Output::Streaming(tx) => (tx, state.buf.split().freeze()),
                Output::Closed => return,
            }
        };
        if !chunk.is_empty() {
            let _ = tx.send(chunk).await;
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response already closed")
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Stats {
    /// 0 until the first header or body write.
    status: AtomicU16,
    bytes: AtomicUsize,
}

/// A [`Sink`] that records the response status and body size.
///
/// Clones share the same response. A writer belongs to exactly one request.
#[derive(Clone)]
pub struct ResponseWriter {
    sink: Sink,
    stats: Arc<Stats>,
}

impl ResponseWriter {
    pub fn new(sink: Sink) -> Self {
        Self { sink, stats: Arc::default() }
    }

    /// The status sent to the client, or `None` if nothing has been written.
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.stats.status.load(Ordering::Acquire)).ok()
    }

    /// Total body bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.stats.bytes.load(Ordering::Acquire)
    }

    /// The underlying sink, for writes that should bypass tracking.
    pub fn get_ref(&self) -> &Sink {
        &self.sink
    }

    pub fn headers_mut(&self) -> MappedMutexGuard<'_, HeaderMap> {
        self.sink.headers_mut()
    }

    /// Replaces the header `name` with `value`.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.sink.headers_mut().insert(name, value);
    }

    pub fn write_header(&self, status: StatusCode) {
        let _ = self.stats.status.compare_exchange(
            0,
            status.as_u16(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.sink.write_header(status);
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_header();
        let n = self.sink.write(buf)?;
        self.stats.bytes.fetch_add(n, Ordering::AcqRel);
        Ok(n)
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.ensure_header();
        self.sink.flush().await
    }

    pub async fn copy_from<R>(&self, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_header();
        self.sink
            .copy_chunks(reader, |n| {
                self.stats.bytes.fetch_add(n, Ordering::AcqRel);
            })
            .await
    }

    fn ensure_header(&self) {
        if self.stats.status.load(Ordering::Acquire) == 0 {
            self.write_header(StatusCode::OK);
        }
    }

    pub(crate) async fn finish(&self) {
        self.sink.finish().await;
    }
}

impl io::Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseWriter::write(self, buf)
    }

    /// Buffered writes need no flushing here; use [`ResponseWriter::flush`]
    /// to push bytes to the client.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    async fn body_of(response: http::Response<Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn first_write_latches_ok() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        assert_eq!(w.status(), None);

        w.write(b"hello").unwrap();
        w.write_header(StatusCode::NOT_FOUND);
        assert_eq!(w.status(), Some(StatusCode::OK));

        w.finish().await;
        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "hello");
    }

    #[tokio::test]
    async fn explicit_status_wins_over_later_writes() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        w.write_header(StatusCode::CREATED);
        w.write_header(StatusCode::BAD_REQUEST);
        w.write(b"{}").unwrap();
        assert_eq!(w.status(), Some(StatusCode::CREATED));

        w.finish().await;
        assert_eq!(head.await.unwrap().status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn bytes_written_is_sum_of_writes() {
        let (sink, _head) = Sink::channel();
        let mut w = ResponseWriter::new(sink);
        let chunks: [&[u8]; 4] = [b"a", b"", b"bcd", b"efghij"];
        for chunk in chunks {
            w.write_all(chunk).unwrap();
        }
        write!(w, "{}", 12345).unwrap();
        assert_eq!(w.bytes_written(), 1 + 3 + 6 + 5);
    }

    #[tokio::test]
    async fn flush_streams_the_body() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        w.set_header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        w.write(b"first,").unwrap();
        w.flush().await.unwrap();
        assert!(w.get_ref().is_streaming());

        // The head is available before the handler is done.
        let response = head.await.unwrap();
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/plain");

        let writer = w.clone();
        let finish = tokio::spawn(async move {
            writer.write(b"second").unwrap();
            writer.finish().await;
        });
        assert_eq!(body_of(response).await, "first,second");
        finish.await.unwrap();
        assert_eq!(w.bytes_written(), 12);
    }

    #[tokio::test]
    async fn copy_from_counts_bytes() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        let data = vec![7u8; 20_000];

        let writer = w.clone();
        let reader = data.clone();
        let task = tokio::spawn(async move {
            let n = writer.copy_from(&reader[..]).await.unwrap();
            writer.finish().await;
            n
        });

        let response = head.await.unwrap();
        assert_eq!(body_of(response).await.len(), data.len());
        assert_eq!(task.await.unwrap(), 20_000);
        assert_eq!(w.bytes_written(), 20_000);
        assert_eq!(w.status(), Some(StatusCode::OK));
    }

    /// Yields `data` once, then fails.
    struct FailingReader {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => buf.put_slice(&data),
                None => return std::task::Poll::Ready(Err(io::Error::other("disk"))),
            }
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copy_from_counts_bytes_sent_before_a_read_error() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);

        let writer = w.clone();
        let task = tokio::spawn(async move {
            let err = writer.copy_from(FailingReader { data: Some(vec![1u8; 100]) }).await.unwrap_err();
            writer.finish().await;
            err
        });

        let response = head.await.unwrap();
        assert_eq!(body_of(response).await.len(), 100);
        assert_eq!(task.await.unwrap().to_string(), "disk");
        assert_eq!(w.bytes_written(), 100);
    }

    #[tokio::test]
    async fn writes_after_finish_fail() {
        let (sink, _head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        w.finish().await;
        let err = w.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(w.bytes_written(), 0);
    }
}
