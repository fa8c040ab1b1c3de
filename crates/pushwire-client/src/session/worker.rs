//! Stream worker
//!
//! One worker task per session. It reads the stream connection line by
//! line, hands decoded events to the listener and, when the connection is
//! lost, binds the session to a new one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace, warn};

use super::listener::Dispatcher;
use super::manager::Shared;
use crate::config::Endpoint;
use crate::error::{SessionError, StreamFault};
use crate::protocol::{
    decode_line, HeaderError, HeaderStep, Request, ServerError, SessionHeader,
    SessionHeaderBuilder, UpdateEvent,
};
use crate::streaming::{LineReader, StreamError};
use crate::transport::{Transport, TransportError};

/// Requests from the manager to a running worker
#[derive(Debug)]
pub(crate) enum Command {
    /// Drop the current connection and bind again now
    Rebind,
}

/// Why a create or bind handshake did not produce a stream
#[derive(Debug)]
pub(crate) enum HandshakeFailure {
    /// The server answered with an error
    Rejected(ServerError),
    /// Network failure, timeout or an unreadable response
    Failed(SessionError),
}

/// Open a stream connection and read its response header.
///
/// On success the reader is positioned on the first line after the header.
/// The connection is released on every error path.
pub(crate) async fn open_session(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    request: &Request,
    timeout: Duration,
    max_line_length: usize,
) -> Result<(LineReader, SessionHeader), HandshakeFailure> {
    let handshake = async {
        let stream = transport
            .open(endpoint, request)
            .await
            .map_err(|e| HandshakeFailure::Failed(e.into()))?;
        let mut reader = LineReader::new(stream).with_max_line_length(max_line_length);
        let mut header = SessionHeaderBuilder::new();

        loop {
            let line = match reader.next_line().await {
                Ok(line) => line,
                Err(StreamError::EndOfStream) => {
                    return Err(HandshakeFailure::Failed(
                        TransportError::ConnectionClosed.into(),
                    ))
                }
                Err(StreamError::Fault(e)) => return Err(HandshakeFailure::Failed(e.into())),
                Err(e @ (StreamError::InvalidUtf8 { .. } | StreamError::LineTooLong { .. })) => {
                    return Err(HandshakeFailure::Failed(SessionError::Handshake(
                        e.to_string(),
                    )))
                }
            };

            match header.push_line(&line) {
                Ok(HeaderStep::NeedMore) => {}
                Ok(HeaderStep::Complete(header)) => return Ok((reader, header)),
                Err(HeaderError::Rejected(e)) => return Err(HandshakeFailure::Rejected(e)),
                Err(e) => return Err(HandshakeFailure::Failed(SessionError::Handshake(e.to_string()))),
            }
        }
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| HandshakeFailure::Failed(SessionError::Timeout(timeout)))?
}

/// Resolves once shutdown is signalled or the manager side is gone
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// How consuming one connection ended
#[derive(Debug)]
enum Interruption {
    /// `disconnect()` was called
    Shutdown,
    /// The server closed the session
    ServerClosed(Option<ServerError>),
    /// The server reported an error the session cannot survive
    Fatal(ServerError),
    /// The connection was lost; the session may still be bound again
    Lost(StreamFault),
    /// `bind()` was called
    RebindRequested,
}

enum Next {
    Shutdown,
    Command(Command),
    Line(Result<Result<String, StreamError>, tokio::time::error::Elapsed>),
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        generation: u64,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Receiver<bool>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            shared,
            generation,
            dispatcher,
            shutdown,
            commands,
        }
    }

    /// Consume connections until the session ends
    #[instrument(name = "session_worker", skip_all, fields(generation = self.generation))]
    pub(crate) async fn run(mut self, mut reader: LineReader) {
        loop {
            let interruption = self.consume(&mut reader).await;
            reader.close();

            let cause = match interruption {
                Interruption::Shutdown => {
                    debug!("Worker stopped by disconnect");
                    return;
                }
                Interruption::ServerClosed(cause) => {
                    self.shared
                        .close_by_server(self.generation, &self.dispatcher, cause);
                    return;
                }
                Interruption::Fatal(error) => {
                    self.shared
                        .fail(self.generation, &self.dispatcher, SessionError::Fatal(error));
                    return;
                }
                Interruption::Lost(fault) => {
                    if !self.shared.config().autorebind {
                        self.shared.fail(
                            self.generation,
                            &self.dispatcher,
                            SessionError::Interrupted(fault),
                        );
                        return;
                    }
                    info!("Stream interrupted: {}", fault);
                    SessionError::Interrupted(fault)
                }
                Interruption::RebindRequested => {
                    info!("Rebind requested");
                    SessionError::Interrupted(StreamFault::EndOfStream)
                }
            };

            match self.rebind(cause).await {
                Some(next) => reader = next,
                None => return,
            }
        }
    }

    async fn consume(&mut self, reader: &mut LineReader) -> Interruption {
        let liveness = self
            .shared
            .config()
            .stall_timeout(self.shared.granted_keepalive(self.generation));
        debug!(?liveness, "Streaming");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => Next::Shutdown,
                Some(command) = self.commands.recv() => Next::Command(command),
                read = tokio::time::timeout(liveness, reader.next_line()) => Next::Line(read),
            };

            match next {
                Next::Shutdown => return Interruption::Shutdown,
                Next::Command(Command::Rebind) => return Interruption::RebindRequested,
                Next::Line(Err(_)) => {
                    warn!("No data for {:?}, treating stream as lost", liveness);
                    return Interruption::Lost(StreamFault::Stalled(liveness));
                }
                Next::Line(Ok(Ok(line))) => {
                    if let Some(interruption) = self.handle_line(&line) {
                        return interruption;
                    }
                }
                Next::Line(Ok(Err(StreamError::EndOfStream))) => {
                    return Interruption::Lost(StreamFault::EndOfStream)
                }
                Next::Line(Ok(Err(StreamError::Fault(e)))) => {
                    return Interruption::Lost(StreamFault::Transport(e))
                }
                Next::Line(Ok(Err(StreamError::LineTooLong { limit }))) => {
                    warn!(limit, "Line too long, dropping connection");
                    return Interruption::Lost(StreamFault::LineTooLong(limit));
                }
                Next::Line(Ok(Err(e @ StreamError::InvalidUtf8 { .. }))) => {
                    warn!("Skipping line: {}", e);
                }
            }
        }
    }

    fn handle_line(&self, line: &str) -> Option<Interruption> {
        if line.is_empty() {
            return None;
        }

        match decode_line(line) {
            Ok(UpdateEvent::Heartbeat) => {
                trace!("Heartbeat");
                None
            }
            Ok(UpdateEvent::Row(update)) => {
                self.dispatcher
                    .dispatch(|l| l.on_row_update(&update.item, &update.fields));
                None
            }
            Ok(UpdateEvent::ControlAck(detail)) => {
                self.dispatcher
                    .dispatch(|l| l.on_control_acknowledged(detail.as_deref()));
                None
            }
            Ok(UpdateEvent::Error(error)) => {
                warn!(code = error.code, "Server error: {}", error.message);
                self.dispatcher
                    .dispatch(|l| l.on_session_error(error.code, &error.message));
                error.is_fatal().then_some(Interruption::Fatal(error))
            }
            Ok(UpdateEvent::EndOfStream(cause)) => Some(Interruption::ServerClosed(cause)),
            Err(malformed) => {
                warn!("Discarding {}", malformed);
                None
            }
        }
    }

    /// Bind the session to a new connection.
    ///
    /// Returns the new reader, or `None` once the session has ended (failed
    /// or closed meanwhile).
    async fn rebind(&mut self, cause: SessionError) -> Option<LineReader> {
        let config = self.shared.config().clone();
        let policy = &config.rebind;
        let mut last_cause = cause;
        let mut attempt = 0;

        loop {
            if attempt >= policy.max_attempts {
                self.shared.fail(
                    self.generation,
                    &self.dispatcher,
                    SessionError::RebindExhausted {
                        attempts: attempt,
                        last_cause: Box::new(last_cause),
                    },
                );
                return None;
            }
            attempt += 1;

            let session_id = self.shared.enter_rebinding(self.generation)?;
            let delay = policy.delay_for_attempt(attempt);
            info!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Rebinding session {}",
                session_id
            );

            let request = Request::bind_session(&session_id, &config.options);
            let transport = self.shared.transport();
            let attempt_bind = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                open_session(
                    transport.as_ref(),
                    &config.endpoint,
                    &request,
                    config.connect_timeout(),
                    config.max_line_length,
                )
                .await
            };

            let result = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => None,
                result = attempt_bind => Some(result),
            };

            match result {
                None => {
                    debug!("Rebind abandoned by disconnect");
                    return None;
                }
                Some(Ok((reader, header))) => {
                    if !self.shared.complete_rebind(self.generation, header) {
                        reader.close();
                        return None;
                    }
                    info!(attempt, "Session {} rebound", session_id);
                    self.dispatcher.dispatch(|l| l.on_rebind_succeeded());
                    return Some(reader);
                }
                Some(Err(HandshakeFailure::Rejected(error))) => {
                    self.dispatcher
                        .dispatch(|l| l.on_session_error(error.code, &error.message));
                    self.shared.fail(
                        self.generation,
                        &self.dispatcher,
                        SessionError::BindRejected(error),
                    );
                    return None;
                }
                Some(Err(HandshakeFailure::Failed(error))) => {
                    warn!(attempt, "Rebind attempt failed: {}", error);
                    last_cause = error;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::DEFAULT_MAX_LINE_LENGTH;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 8080, false)
    }

    fn request() -> Request {
        Request::bind_session("S1", &Default::default())
    }

    async fn open(
        transport: &MockTransport,
        timeout: Duration,
    ) -> Result<(LineReader, SessionHeader), HandshakeFailure> {
        open_session(transport, &endpoint(), &request(), timeout, DEFAULT_MAX_LINE_LENGTH).await
    }

    #[tokio::test]
    async fn test_open_session_reads_header() {
        let transport = MockTransport::new();
        let conn = transport.expect_connection();
        conn.send_lines(&["OK", "SessionId=S1", "KeepaliveMillis=5000", "", "PROBE"]);

        let (mut reader, header) = open(&transport, Duration::from_secs(1)).await.unwrap();

        assert_eq!(header.session_id, "S1");
        assert_eq!(header.keepalive, Some(Duration::from_secs(5)));
        assert_eq!(reader.next_line().await.unwrap(), "PROBE");
    }

    #[tokio::test]
    async fn test_open_session_rejected() {
        let transport = MockTransport::new();
        let conn = transport.expect_connection();
        conn.send_line("ERROR,20,session not found");

        let result = open(&transport, Duration::from_secs(1)).await;

        match result {
            Err(HandshakeFailure::Rejected(e)) => {
                assert_eq!(e, ServerError::new(20, "session not found"))
            }
            other => panic!("expected rejection, got {:?}", other.map(|(_, h)| h)),
        }
        assert_eq!(conn.release_count(), 1);
    }

    #[tokio::test]
    async fn test_open_session_closed_before_header() {
        let transport = MockTransport::new();
        let conn = transport.expect_connection();
        conn.send_line("OK");
        conn.close();

        let result = open(&transport, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(HandshakeFailure::Failed(SessionError::Transport(
                TransportError::ConnectionClosed
            )))
        ));
        assert_eq!(conn.release_count(), 1);
    }

    #[tokio::test]
    async fn test_open_session_times_out() {
        let transport = MockTransport::new();
        let conn = transport.expect_connection();
        conn.send_line("OK");

        let result = open(&transport, Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(HandshakeFailure::Failed(SessionError::Timeout(_)))
        ));
        assert_eq!(conn.release_count(), 1);
    }

    #[tokio::test]
    async fn test_open_session_header_line_too_long() {
        let transport = MockTransport::new();
        let conn = transport.expect_connection();
        conn.send_chunk("OK\r\nSessionId=S1xxxxxxxxxxxxxxxx");

        let result =
            open_session(&transport, &endpoint(), &request(), Duration::from_secs(1), 16).await;
        match result {
            Err(HandshakeFailure::Failed(SessionError::Handshake(message))) => {
                assert!(message.contains("16 bytes"), "{}", message)
            }
            other => panic!("expected handshake error, got {:?}", other.map(|(_, h)| h)),
        }
        assert_eq!(conn.release_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signalled_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_signalled(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        shutdown_signalled(&mut rx).await;
    }
}
