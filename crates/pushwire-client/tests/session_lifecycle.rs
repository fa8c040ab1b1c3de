//! Session lifecycle tests
//!
//! Drive a SessionManager over scripted connections and check the phases it
//! goes through and the callbacks its listener receives.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use pushwire_client::protocol::{BIND_SESSION_PATH, CONTROL_PATH, CREATE_SESSION_PATH};
use pushwire_client::testing::{wait_for, ListenerEvent, RecordingListener};
use pushwire_client::transport::mock::{MockConnection, MockTransport};
use pushwire_client::{
    ClientConfig, ControlError, Credentials, Endpoint, FieldValue, MaxFrequency, Phase,
    RebindPolicy, ServerError, SessionError, SessionManager, StreamFault, Subscription, TableId,
    TransportError,
};

const TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Helpers
// =============================================================================

fn config() -> ClientConfig {
    ClientConfig::new(Endpoint::new("push.example.com", 8080, false), "QUOTES")
}

struct Harness {
    transport: Arc<MockTransport>,
    manager: SessionManager,
    listener: Arc<RecordingListener>,
}

impl Harness {
    fn new(config: ClientConfig) -> Self {
        let transport = Arc::new(MockTransport::new());
        Self {
            manager: SessionManager::new(config, transport.clone()),
            transport,
            listener: Arc::new(RecordingListener::new()),
        }
    }

    /// Script an accepted connection for `session_id`
    fn accepting(&self, session_id: &str) -> MockConnection {
        let conn = self.transport.expect_connection();
        conn.accept_session(session_id);
        conn
    }

    async fn create(&self) -> Result<pushwire_client::SessionInfo, SessionError> {
        self.manager
            .create(Credentials::anonymous(), self.listener.clone())
            .await
    }

    async fn terminal(&self) -> Phase {
        tokio::time::timeout(TIMEOUT, self.manager.wait_for_terminal())
            .await
            .expect("session did not end")
    }
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    wait_for(
        || {
            let ok = condition();
            async move { ok }
        },
        TIMEOUT,
    )
    .await
}

fn row(item: &str, fields: &[FieldValue]) -> ListenerEvent {
    ListenerEvent::Row {
        item: item.to_string(),
        fields: fields.to_vec(),
    }
}

fn value(s: &str) -> FieldValue {
    FieldValue::from(s)
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_create_then_stream_rows() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    conn.send_lines(&["PROBE", "1,100.5|#=", "LOOP", "2,hello|world"]);

    let info = h.create().await.unwrap();
    assert_eq!(info.session_id, "S1");
    assert_eq!(info.bind_count, 0);
    assert_eq!(h.manager.phase(), Phase::Streaming);

    assert!(eventually(|| h.listener.len() == 3).await);
    assert_eq!(
        h.listener.events(),
        vec![
            ListenerEvent::SessionCreated("S1".into()),
            row("1", &[value("100.5"), FieldValue::Unchanged]),
            row("2", &[value("hello"), value("world")]),
        ]
    );
    assert_eq!(h.transport.stream_requests()[0].path, CREATE_SESSION_PATH);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_create_rejected() {
    let h = Harness::new(config());
    let conn = h.transport.expect_connection();
    conn.send_line("ERROR,1,bad credentials");

    let err = h.create().await.unwrap_err();
    let expected = SessionError::CreationRejected(ServerError::new(1, "bad credentials"));
    assert_eq!(err, expected);
    assert_eq!(h.manager.phase(), Phase::Failed);
    assert_eq!(h.manager.last_error(), Some(expected.clone()));
    assert!(h.manager.session().is_none());
    assert_eq!(
        h.listener.events(),
        vec![
            ListenerEvent::SessionError {
                code: 1,
                message: "bad credentials".into()
            },
            ListenerEvent::SessionFailed(expected),
        ]
    );
    assert_eq!(conn.release_count(), 1);
}

#[tokio::test]
async fn test_create_transport_failure() {
    let h = Harness::new(config());
    h.transport.refuse_next(TransportError::ConnectionFailed("refused".into()));

    let err = h.create().await.unwrap_err();
    assert_eq!(
        err,
        SessionError::Transport(TransportError::ConnectionFailed("refused".into()))
    );
    assert_eq!(h.manager.phase(), Phase::Failed);
}

#[tokio::test]
async fn test_create_again_after_close() {
    let h = Harness::new(config());
    h.accepting("S1");
    h.create().await.unwrap();
    h.manager.disconnect().await;
    assert_eq!(h.manager.phase(), Phase::Closed);

    h.accepting("S2");
    let info = h.create().await.unwrap();
    assert_eq!(info.session_id, "S2");
    assert_eq!(h.manager.phase(), Phase::Streaming);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_dropped_create_does_not_block_the_next_one() {
    let h = Harness::new(config());
    h.accepting("S1");
    h.transport.set_open_delay(Duration::from_millis(200));

    let first = tokio::time::timeout(Duration::from_millis(50), h.create()).await;
    assert!(first.is_err());
    assert_eq!(h.manager.phase(), Phase::Failed);
    assert_eq!(h.manager.last_error(), Some(SessionError::Cancelled));
    assert_eq!(
        h.listener.events(),
        vec![ListenerEvent::SessionFailed(SessionError::Cancelled)]
    );

    h.transport.set_open_delay(Duration::ZERO);
    let info = h.create().await.unwrap();
    assert_eq!(info.session_id, "S1");
    assert_eq!(h.manager.phase(), Phase::Streaming);

    h.manager.disconnect().await;
}

// =============================================================================
// Stream events
// =============================================================================

#[tokio::test]
async fn test_heartbeats_and_malformed_lines_are_not_delivered() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    conn.send_lines(&["PROBE", "garbage", "1,#?", "PROBE", "1,a|#-"]);
    assert!(eventually(|| h.listener.rows().len() == 1).await);

    assert_eq!(
        h.listener.rows(),
        vec![("1".to_string(), vec![value("a"), FieldValue::Absent])]
    );
    assert_eq!(h.listener.len(), 2);
    assert_eq!(h.manager.phase(), Phase::Streaming);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_control_ack_and_non_fatal_error() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    conn.send_lines(&["REQOK,3", "ERROR,7,slow consumer", "1,x"]);
    assert!(eventually(|| h.listener.len() == 4).await);

    assert_eq!(
        h.listener.events()[1..].to_vec(),
        vec![
            ListenerEvent::ControlAcknowledged(Some("3".into())),
            ListenerEvent::SessionError {
                code: 7,
                message: "slow consumer".into()
            },
            row("1", &[value("x")]),
        ]
    );
    assert_eq!(h.manager.phase(), Phase::Streaming);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_fatal_error_fails_session() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    conn.send_lines(&["ERROR,60,incompatible client", "1,never"]);

    assert_eq!(h.terminal().await, Phase::Failed);
    let expected = SessionError::Fatal(ServerError::new(60, "incompatible client"));
    assert_eq!(h.manager.last_error(), Some(expected.clone()));
    assert_eq!(
        h.listener.events()[1..].to_vec(),
        vec![
            ListenerEvent::SessionError {
                code: 60,
                message: "incompatible client".into()
            },
            ListenerEvent::SessionFailed(expected),
        ]
    );
    assert!(eventually(|| conn.is_released()).await);
    assert_eq!(h.transport.open_count(), 1);
}

#[tokio::test]
async fn test_server_end_closes_session() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    conn.send_lines(&["1,a", "END,31,closed by administrator"]);

    assert_eq!(h.terminal().await, Phase::Closed);
    assert_eq!(h.listener.events().last(), Some(&ListenerEvent::StreamClosed));
    assert_eq!(h.listener.count(&ListenerEvent::StreamClosed), 1);
    assert!(h.manager.last_error().is_none());
    assert_eq!(h.transport.open_count(), 1);
}

// =============================================================================
// Rebind
// =============================================================================

#[tokio::test]
async fn test_rebind_keeps_session_id() {
    let h = Harness::new(config());
    let first = h.accepting("S1");
    let second = h.accepting("S1");
    h.create().await.unwrap();

    first.send_line("1,before");
    first.close();
    second.send_line("1,after");

    assert!(eventually(|| h.listener.rows().len() == 2).await);
    let session = h.manager.session().unwrap();
    assert_eq!(session.session_id, "S1");
    assert_eq!(session.bind_count, 1);
    assert_eq!(h.manager.phase(), Phase::Streaming);
    assert_eq!(
        h.listener.events(),
        vec![
            ListenerEvent::SessionCreated("S1".into()),
            row("1", &[value("before")]),
            ListenerEvent::RebindSucceeded,
            row("1", &[value("after")]),
        ]
    );

    let bind = &h.transport.stream_requests()[1];
    assert_eq!(bind.path, BIND_SESSION_PATH);
    assert_eq!(bind.param("LS_session"), Some("S1"));
    assert_eq!(first.release_count(), 1);
    assert_eq!(second.release_count(), 0);

    h.manager.disconnect().await;
    assert!(eventually(|| second.release_count() == 1).await);
}

#[tokio::test]
async fn test_rebind_after_transport_fault() {
    let h = Harness::new(config());
    let first = h.accepting("S1");
    h.accepting("S1");
    h.create().await.unwrap();

    first.fail(TransportError::ConnectionReset("reset by peer".into()));

    assert!(eventually(|| h.listener.count(&ListenerEvent::RebindSucceeded) == 1).await);
    assert_eq!(h.manager.session().unwrap().bind_count, 1);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_autorebind_disabled_fails_on_end_of_stream() {
    let h = Harness::new(config().with_autorebind(false));
    let conn = h.accepting("S1");
    h.accepting("S1");
    h.create().await.unwrap();

    conn.close();

    assert_eq!(h.terminal().await, Phase::Failed);
    let expected = SessionError::Interrupted(StreamFault::EndOfStream);
    assert_eq!(h.manager.last_error(), Some(expected.clone()));
    assert_eq!(
        h.listener.events().last(),
        Some(&ListenerEvent::SessionFailed(expected))
    );
    assert_eq!(h.transport.open_count(), 1);
}

#[tokio::test]
async fn test_zero_rebind_attempts_fails_without_reconnecting() {
    let h = Harness::new(config().with_rebind_policy(RebindPolicy::new(0)));
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    conn.close();

    assert_eq!(h.terminal().await, Phase::Failed);
    assert_eq!(
        h.manager.last_error(),
        Some(SessionError::RebindExhausted {
            attempts: 0,
            last_cause: Box::new(SessionError::Interrupted(StreamFault::EndOfStream)),
        })
    );
    assert_eq!(h.transport.open_count(), 1);
}

#[tokio::test]
async fn test_rebind_attempts_are_bounded() {
    let h = Harness::new(config().with_rebind_policy(RebindPolicy::new(2)));
    let conn = h.accepting("S1");
    h.transport.refuse_next(TransportError::ConnectionFailed("down".into()));
    h.transport.refuse_next(TransportError::ConnectionReset("reset by peer".into()));
    h.accepting("S1");
    h.create().await.unwrap();

    conn.close();

    assert_eq!(h.terminal().await, Phase::Failed);
    assert_eq!(
        h.manager.last_error(),
        Some(SessionError::RebindExhausted {
            attempts: 2,
            last_cause: Box::new(SessionError::Transport(TransportError::ConnectionReset(
                "reset by peer".into()
            ))),
        })
    );
    // One create plus two binds; the third scripted connection is never used
    assert_eq!(h.transport.open_count(), 3);
    assert_eq!(h.listener.count(&ListenerEvent::RebindSucceeded), 0);
}

#[tokio::test]
async fn test_attempt_counter_resets_after_successful_bind() {
    let h = Harness::new(config().with_rebind_policy(RebindPolicy::new(1)));
    let first = h.accepting("S1");
    let second = h.accepting("S1");
    h.accepting("S1");
    h.create().await.unwrap();

    first.close();
    assert!(eventually(|| h.listener.count(&ListenerEvent::RebindSucceeded) == 1).await);
    second.close();
    assert!(eventually(|| h.listener.count(&ListenerEvent::RebindSucceeded) == 2).await);

    assert_eq!(h.manager.session().unwrap().bind_count, 2);
    assert_eq!(h.manager.phase(), Phase::Streaming);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_bind_rejected_fails_session() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    let bind = h.transport.expect_connection();
    bind.send_line("ERROR,20,session not found");
    h.create().await.unwrap();

    conn.close();

    assert_eq!(h.terminal().await, Phase::Failed);
    let expected = SessionError::BindRejected(ServerError::new(20, "session not found"));
    assert_eq!(h.manager.last_error(), Some(expected.clone()));
    assert_eq!(
        h.listener.events()[1..].to_vec(),
        vec![
            ListenerEvent::SessionError {
                code: 20,
                message: "session not found".into()
            },
            ListenerEvent::SessionFailed(expected),
        ]
    );
    assert_eq!(h.transport.open_count(), 2);
}

#[tokio::test]
async fn test_stalled_stream_is_rebound() {
    let h = Harness::new(config().with_liveness_timeout(Duration::from_millis(100)));
    let stalled = h.accepting("S1");
    let fresh = h.accepting("S1");
    h.create().await.unwrap();

    assert!(eventually(|| h.listener.count(&ListenerEvent::RebindSucceeded) == 1).await);
    assert_eq!(stalled.release_count(), 1);
    assert!(fresh.is_opened());

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_heartbeats_keep_stream_alive() {
    let h = Harness::new(config().with_liveness_timeout(Duration::from_millis(150)));
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.send_line("PROBE");
    }

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.manager.phase(), Phase::Streaming);
    assert_eq!(h.listener.len(), 1);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_granted_keepalive_extends_liveness() {
    let h = Harness::new(config().with_liveness_timeout(Duration::from_millis(150)));
    let conn = h.transport.expect_connection();
    conn.send_lines(&["OK", "SessionId=S1", "KeepaliveMillis=30000", ""]);
    h.accepting("S1");

    let info = h.create().await.unwrap();
    assert_eq!(info.keepalive, Some(Duration::from_secs(30)));

    tokio::time::sleep(Duration::from_millis(260)).await;
    conn.send_line("PROBE");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.manager.phase(), Phase::Streaming);
    assert_eq!(h.listener.count(&ListenerEvent::RebindSucceeded), 0);
    assert_eq!(conn.release_count(), 0);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_overlong_line_drops_connection_and_rebinds() {
    let mut config = config();
    config.max_line_length = 32;
    let h = Harness::new(config);
    let first = h.accepting("S1");
    h.accepting("S1");
    h.create().await.unwrap();

    first.send_chunk("1,".to_string() + &"x".repeat(64));

    assert!(eventually(|| h.listener.count(&ListenerEvent::RebindSucceeded) == 1).await);
    assert_eq!(first.release_count(), 1);
    assert_eq!(h.manager.session().unwrap().bind_count, 1);
    assert!(h.listener.rows().is_empty());

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_explicit_bind_with_autorebind_disabled() {
    let h = Harness::new(config().with_autorebind(false));
    let first = h.accepting("S1");
    h.accepting("S1");
    h.create().await.unwrap();

    h.manager.bind().unwrap();

    assert!(eventually(|| h.listener.count(&ListenerEvent::RebindSucceeded) == 1).await);
    assert_eq!(h.manager.session().unwrap().bind_count, 1);
    assert_eq!(first.release_count(), 1);

    h.manager.disconnect().await;
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn test_disconnect_is_final() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    h.manager.disconnect().await;
    assert_eq!(h.manager.phase(), Phase::Closed);
    assert!(h.manager.session().is_none());

    conn.send_line("1,late");
    h.manager.disconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        h.listener.events(),
        vec![
            ListenerEvent::SessionCreated("S1".into()),
            ListenerEvent::StreamClosed,
        ]
    );
    assert!(eventually(|| conn.release_count() == 1).await);

    let control = h.transport.control_requests();
    assert_eq!(control.len(), 1);
    assert_eq!(control[0].1.path, CONTROL_PATH);
    assert_eq!(control[0].1.param("LS_op"), Some("destroy"));
    assert_eq!(control[0].1.param("LS_session"), Some("S1"));
}

#[tokio::test]
async fn test_disconnect_during_rebind() {
    let h = Harness::new(config());
    let first = h.accepting("S1");
    let never = h.accepting("S1");
    h.create().await.unwrap();

    h.transport.set_open_delay(Duration::from_millis(300));
    first.close();
    assert!(eventually(|| h.manager.phase() == Phase::Rebinding).await);

    h.manager.disconnect().await;
    assert_eq!(h.manager.phase(), Phase::Closed);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.manager.phase(), Phase::Closed);
    assert_eq!(h.listener.events().last(), Some(&ListenerEvent::StreamClosed));
    assert_eq!(h.listener.count(&ListenerEvent::StreamClosed), 1);
    assert_eq!(h.listener.count(&ListenerEvent::RebindSucceeded), 0);
    assert_eq!(first.release_count(), 1);
    assert!(!never.is_opened());
}

#[tokio::test]
async fn test_disconnect_during_create() {
    let h = Harness::new(config());
    h.accepting("S1");
    h.transport.set_open_delay(Duration::from_millis(300));

    let manager = h.manager.clone();
    let listener = h.listener.clone();
    let create = tokio::spawn(async move {
        manager.create(Credentials::anonymous(), listener).await
    });
    assert!(eventually(|| h.manager.phase() == Phase::Creating).await);

    h.manager.disconnect().await;

    assert_eq!(create.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(h.manager.phase(), Phase::Closed);
    assert_eq!(h.listener.events(), vec![ListenerEvent::StreamClosed]);
    // No session id yet, so nothing to destroy
    assert!(h.transport.control_requests().is_empty());
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_subscribe_and_unsubscribe() {
    let h = Harness::new(config());
    h.accepting("S1");
    h.create().await.unwrap();

    let quotes = Subscription::merge(["EUR/USD"], ["bid", "ask"]);
    let news = Subscription::merge(["news"], ["headline"]);
    let first = h.manager.subscribe(quotes.clone()).await.unwrap();
    let second = h.manager.subscribe(news).await.unwrap();
    assert_eq!(first, TableId(1));
    assert_eq!(second, TableId(2));
    assert_eq!(h.manager.subscription(first), Some(quotes));

    h.manager
        .change_frequency(first, MaxFrequency::Limited(1.0))
        .await
        .unwrap();
    assert_eq!(
        h.manager.subscription(first).unwrap().max_frequency,
        Some(MaxFrequency::Limited(1.0))
    );

    h.manager.unsubscribe(first).await.unwrap();
    assert_eq!(
        h.manager.unsubscribe(first).await,
        Err(ControlError::UnknownTable(first))
    );
    assert_eq!(h.manager.subscriptions().len(), 1);

    let ops: Vec<_> = h
        .transport
        .control_requests()
        .iter()
        .map(|(_, r)| r.param("LS_op").unwrap_or_default().to_string())
        .collect();
    assert_eq!(ops, vec!["add", "add", "reconf", "delete"]);

    h.manager.disconnect().await;
}

#[tokio::test]
async fn test_rejected_control_request_leaves_stream_alone() {
    let h = Harness::new(config());
    let conn = h.accepting("S1");
    h.create().await.unwrap();

    h.transport.reply_to_control("ERROR,17,unknown item");
    let err = h
        .manager
        .subscribe(Subscription::merge(["nope"], ["x"]))
        .await
        .unwrap_err();

    assert_eq!(err, ControlError::Rejected(ServerError::new(17, "unknown item")));
    assert!(h.manager.subscriptions().is_empty());
    assert_eq!(h.manager.phase(), Phase::Streaming);

    conn.send_line("1,still here");
    assert!(eventually(|| h.listener.rows().len() == 1).await);

    h.manager.disconnect().await;
}
