//! Test utilities for pushwire-client
//!
//! Provides a local HTTP server for end-to-end tests, a listener that
//! records every callback, and a polling helper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::config::{ClientConfig, Endpoint};
use crate::error::SessionError;
use crate::protocol::FieldValue;
use crate::session::{SessionInfo, SessionListener, SessionManager};
use crate::transport::{HttpTransport, TransportError};

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    pub transport: HttpTransport,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve an axum Router on a free local port
    ///
    /// # Example
    ///
    /// ```ignore
    /// use axum::{routing::post, Router};
    /// use pushwire_client::testing::TestServer;
    ///
    /// let router = Router::new().route(
    ///     "/lightstreamer/create_session.txt",
    ///     post(|| async { "OK\r\nSessionId=S1\r\n\r\nPROBE\r\n" }),
    /// );
    /// let server = TestServer::start(router).await?;
    /// let manager = server.manager("DEFAULT");
    /// ```
    pub async fn start<S>(router: axum::Router<S>) -> Result<Self, TransportError>
    where
        S: Clone + Send + Sync + 'static,
        axum::Router<S>: Into<axum::Router>,
    {
        Self::start_with_timeout(router, Duration::from_secs(2)).await
    }

    /// Same as [`start`](Self::start) with a custom connect timeout
    pub async fn start_with_timeout<S>(
        router: axum::Router<S>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError>
    where
        S: Clone + Send + Sync + 'static,
        axum::Router<S>: Into<axum::Router>,
    {
        // Bind to any available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let router: axum::Router = router.into();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            transport: HttpTransport::new(connect_timeout)?,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Endpoint of the test server
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.ip().to_string(), self.addr.port(), false)
    }

    /// Client configuration pointing at the test server
    pub fn config(&self, adapter_set: &str) -> ClientConfig {
        ClientConfig::new(self.endpoint(), adapter_set)
    }

    /// Session manager talking HTTP to the test server
    pub fn manager(&self, adapter_set: &str) -> SessionManager {
        SessionManager::new(self.config(adapter_set), Arc::new(self.transport.clone()))
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// One recorded listener callback
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Row { item: String, fields: Vec<FieldValue> },
    SessionError { code: i32, message: String },
    StreamClosed,
    RebindSucceeded,
    SessionCreated(String),
    ControlAcknowledged(Option<String>),
    SessionFailed(SessionError),
}

/// Listener that records every callback in arrival order
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// All callbacks so far
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    /// Row updates only, as `(item, fields)`
    pub fn rows(&self) -> Vec<(String, Vec<FieldValue>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Row { item, fields } => Some((item.clone(), fields.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded callbacks equal to `event`
    pub fn count(&self, event: &ListenerEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().push(event);
    }
}

impl SessionListener for RecordingListener {
    fn on_row_update(&self, item: &str, fields: &[FieldValue]) {
        self.record(ListenerEvent::Row {
            item: item.to_string(),
            fields: fields.to_vec(),
        });
    }

    fn on_session_error(&self, code: i32, message: &str) {
        self.record(ListenerEvent::SessionError {
            code,
            message: message.to_string(),
        });
    }

    fn on_stream_closed(&self) {
        self.record(ListenerEvent::StreamClosed);
    }

    fn on_rebind_succeeded(&self) {
        self.record(ListenerEvent::RebindSucceeded);
    }

    fn on_session_created(&self, session: &SessionInfo) {
        self.record(ListenerEvent::SessionCreated(session.session_id.clone()));
    }

    fn on_control_acknowledged(&self, detail: Option<&str>) {
        self.record(ListenerEvent::ControlAcknowledged(detail.map(str::to_string)));
    }

    fn on_session_failed(&self, error: &SessionError) {
        self.record(ListenerEvent::SessionFailed(error.clone()));
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}
