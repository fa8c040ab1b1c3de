//! Mock transport for testing
//!
//! Each call to [`Transport::open`] consumes the next scripted connection.
//! Tests keep a [`MockConnection`] handle and push lines, raw chunks or
//! faults into it while the engine is reading.
//!
//! ```ignore
//! let transport = Arc::new(MockTransport::new());
//! let conn = transport.expect_connection();
//! conn.accept_session("S1");
//! conn.send_line("1,100.5|#=");
//! conn.close(); // orderly end of stream
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ByteStream, Transport, TransportError};
use crate::config::Endpoint;
use crate::protocol::Request;

type Chunk = Result<Bytes, TransportError>;

enum Script {
    Stream(MockConnection),
    Refuse(TransportError),
}

/// Scripted transport
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    control_replies: Mutex<VecDeque<Result<String, TransportError>>>,
    stream_requests: Mutex<Vec<(Endpoint, Request)>>,
    control_requests: Mutex<Vec<(Endpoint, Request)>>,
    open_count: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    control_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `open` to succeed; returns the handle that feeds it
    pub fn expect_connection(&self) -> MockConnection {
        let conn = MockConnection::new();
        self.scripts.lock().push_back(Script::Stream(conn.clone()));
        conn
    }

    /// Script the next `open` to fail with `error`
    pub fn refuse_next(&self, error: TransportError) {
        self.scripts.lock().push_back(Script::Refuse(error));
    }

    /// Queue the body of the next control response (default is `OK`)
    pub fn reply_to_control(&self, body: impl Into<String>) {
        self.control_replies.lock().push_back(Ok(body.into()));
    }

    /// Make the next control exchange fail at the transport level
    pub fn fail_next_control(&self, error: TransportError) {
        self.control_replies.lock().push_back(Err(error));
    }

    /// Delay every `open` (simulates a slow handshake)
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    /// Delay every control exchange
    pub fn set_control_delay(&self, delay: Duration) {
        *self.control_delay.lock() = Some(delay);
    }

    /// Number of `open` calls so far, refused ones included
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Requests passed to `open`, in order
    pub fn stream_requests(&self) -> Vec<Request> {
        self.stream_requests
            .lock()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Requests passed to `exchange`, with the endpoint they were sent to
    pub fn control_requests(&self) -> Vec<(Endpoint, Request)> {
        self.control_requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Result<ByteStream, TransportError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.stream_requests
            .lock()
            .push((endpoint.clone(), request.clone()));

        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Stream(conn)) => conn.attach(),
            Some(Script::Refuse(error)) => Err(error),
            None => Err(TransportError::ConnectionFailed(
                "no scripted connection".to_string(),
            )),
        }
    }

    async fn exchange(&self, endpoint: &Endpoint, request: &Request) -> Result<Bytes, TransportError> {
        self.control_requests
            .lock()
            .push((endpoint.clone(), request.clone()));

        let delay = *self.control_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.control_replies.lock().pop_front();
        reply
            .unwrap_or_else(|| Ok("OK\r\n".to_string()))
            .map(Bytes::from)
    }
}

struct ConnectionInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Chunk>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Chunk>>>,
    opened: AtomicBool,
    released: AtomicUsize,
}

/// Test-side handle of one scripted connection
///
/// Data pushed before the engine opens the connection is buffered.
#[derive(Clone)]
pub struct MockConnection {
    inner: Arc<ConnectionInner>,
}

impl MockConnection {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectionInner {
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                opened: AtomicBool::new(false),
                released: AtomicUsize::new(0),
            }),
        }
    }

    fn attach(&self) -> Result<ByteStream, TransportError> {
        let rx = self.inner.rx.lock().take().ok_or_else(|| {
            TransportError::ConnectionFailed("connection already opened".to_string())
        })?;
        self.inner.opened.store(true, Ordering::SeqCst);
        Ok(Box::pin(MockByteStream {
            rx,
            conn: self.inner.clone(),
        }))
    }

    /// Push raw bytes, delivered as one chunk
    pub fn send_chunk(&self, chunk: impl Into<Bytes>) {
        if let Some(tx) = self.inner.tx.lock().as_ref() {
            let _ = tx.send(Ok(chunk.into()));
        }
    }

    /// Push one line with a `\r\n` terminator
    pub fn send_line(&self, line: &str) {
        self.send_chunk(format!("{}\r\n", line));
    }

    pub fn send_lines(&self, lines: &[&str]) {
        for line in lines {
            self.send_line(line);
        }
    }

    /// Push a successful create/bind response header
    pub fn accept_session(&self, session_id: &str) {
        self.send_lines(&["OK", &format!("SessionId={}", session_id), ""]);
    }

    /// Deliver a transport fault, then end the stream
    pub fn fail(&self, error: TransportError) {
        if let Some(tx) = self.inner.tx.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// End the stream in an orderly way
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }

    /// Whether the engine has opened this connection
    pub fn is_opened(&self) -> bool {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// How many times the engine released this connection
    pub fn release_count(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.release_count() > 0
    }
}

struct MockByteStream {
    rx: mpsc::UnboundedReceiver<Chunk>,
    conn: Arc<ConnectionInner>,
}

impl Stream for MockByteStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for MockByteStream {
    fn drop(&mut self) {
        self.conn.released.fetch_add(1, Ordering::SeqCst);
    }
}
