//! Control channel
//!
//! Subscribe, unsubscribe and rate changes travel as short-lived requests,
//! separate from the stream connection. A failed control request is
//! reported to its caller and never touches the stream.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::config::Endpoint;
use crate::error::ControlError;
use crate::protocol::{parse_control_response, ControlResponse, Params, Request, CONTROL_PATH};
use crate::session::SessionInfo;
use crate::subscription::{MaxFrequency, Snapshot, Subscription, TableId};
use crate::transport::Transport;

/// Control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    /// Add a subscription table
    Add,
    /// Remove a subscription table
    Delete,
    /// Change the parameters of a table
    Reconf,
    /// Close the session
    Destroy,
}

impl ControlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Reconf => "reconf",
            Self::Destroy => "destroy",
        }
    }
}

/// A control command with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub op: ControlOp,
    pub table: Option<TableId>,
    pub params: Params,
}

impl ControlRequest {
    pub fn new(op: ControlOp, table: Option<TableId>, params: Params) -> Self {
        Self { op, table, params }
    }

    pub fn subscribe(table: TableId, subscription: &Subscription) -> Self {
        let mut params = Params::new();
        params
            .push("LS_id", subscription.group())
            .push("LS_schema", subscription.schema())
            .push("LS_mode", subscription.mode.as_str());
        match subscription.snapshot {
            Snapshot::None => {}
            Snapshot::Full => {
                params.push("LS_snapshot", "true");
            }
            Snapshot::Length(n) => {
                params.push("LS_snapshot", n.to_string());
            }
        }
        params.push_opt("LS_requested_max_frequency", subscription.max_frequency);
        Self::new(ControlOp::Add, Some(table), params)
    }

    pub fn unsubscribe(table: TableId) -> Self {
        Self::new(ControlOp::Delete, Some(table), Params::new())
    }

    pub fn modify_rate(table: TableId, frequency: MaxFrequency) -> Self {
        let mut params = Params::new();
        params.push("LS_requested_max_frequency", frequency.to_string());
        Self::new(ControlOp::Reconf, Some(table), params)
    }

    pub fn destroy() -> Self {
        Self::new(ControlOp::Destroy, None, Params::new())
    }

    /// Full request for a session: `LS_session`, `LS_op`, `LS_table`, then
    /// the op-specific parameters
    pub fn to_request(&self, session_id: &str) -> Request {
        let mut params = Params::new();
        params
            .push("LS_session", session_id)
            .push("LS_op", self.op.as_str())
            .push_opt("LS_table", self.table);
        for (key, value) in self.params.iter() {
            params.push(key, value);
        }
        Request::new(CONTROL_PATH, params)
    }
}

/// Sends control requests for a session
#[derive(Clone)]
pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            transport,
            endpoint,
            timeout,
        }
    }

    /// Send one control request and wait for its outcome.
    ///
    /// Goes to the session's control address when the server named one.
    /// Not retried here; retry policy belongs to the caller.
    #[instrument(skip(self, session), fields(session = %session.session_id, op = request.op.as_str()))]
    pub async fn send(
        &self,
        request: &ControlRequest,
        session: &SessionInfo,
    ) -> Result<(), ControlError> {
        let endpoint = match &session.control_address {
            Some(host) => self.endpoint.with_host(host.as_str()),
            None => self.endpoint.clone(),
        };
        let request = request.to_request(&session.session_id);
        debug!("Sending control request to {}", endpoint);

        let body = tokio::time::timeout(self.timeout, self.transport.exchange(&endpoint, &request))
            .await
            .map_err(|_| ControlError::Timeout(self.timeout))??;

        match parse_control_response(&String::from_utf8_lossy(&body)) {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Rejected(error) => {
                warn!(code = error.code, "Control request rejected: {}", error.message);
                Err(ControlError::Rejected(error))
            }
            ControlResponse::Unexpected(line) => Err(ControlError::UnexpectedResponse(line)),
        }
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerError;
    use crate::subscription::SubscriptionMode;
    use crate::transport::mock::MockTransport;
    use crate::transport::TransportError;
    use pretty_assertions::assert_eq;

    fn session(control_address: Option<&str>) -> SessionInfo {
        SessionInfo {
            session_id: "S42".to_string(),
            bind_count: 0,
            adapter_set: "QUOTES".to_string(),
            keepalive: None,
            content_length: None,
            control_address: control_address.map(str::to_string),
            request_limit: None,
        }
    }

    fn channel(transport: Arc<MockTransport>) -> ControlChannel {
        ControlChannel::new(
            transport,
            Endpoint::new("push.example.com", 8080, false),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_subscribe_query() {
        let sub = Subscription::new(SubscriptionMode::Merge, ["EUR/USD", "GBP/USD"], ["bid", "ask"])
            .with_snapshot(Snapshot::Full)
            .with_max_frequency(MaxFrequency::Limited(0.5));
        let request = ControlRequest::subscribe(TableId(3), &sub).to_request("S42");

        assert_eq!(request.path, CONTROL_PATH);
        assert_eq!(
            request.body(),
            "LS_session=S42&LS_op=add&LS_table=3&LS_id=EUR%2FUSD%20GBP%2FUSD\
             &LS_schema=bid%20ask&LS_mode=MERGE&LS_snapshot=true&LS_requested_max_frequency=0.5"
        );
    }

    #[test]
    fn test_unsubscribe_and_destroy_queries() {
        assert_eq!(
            ControlRequest::unsubscribe(TableId(7)).to_request("S1").body(),
            "LS_session=S1&LS_op=delete&LS_table=7"
        );
        assert_eq!(
            ControlRequest::destroy().to_request("S1").body(),
            "LS_session=S1&LS_op=destroy"
        );
        assert_eq!(
            ControlRequest::modify_rate(TableId(2), MaxFrequency::Unlimited)
                .to_request("S1")
                .body(),
            "LS_session=S1&LS_op=reconf&LS_table=2&LS_requested_max_frequency=unlimited"
        );
    }

    #[tokio::test]
    async fn test_send_ok() {
        let transport = Arc::new(MockTransport::new());
        let channel = channel(transport.clone());

        channel
            .send(&ControlRequest::unsubscribe(TableId(1)), &session(None))
            .await
            .unwrap();

        let sent = transport.control_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.host, "push.example.com");
        assert_eq!(sent[0].1.param("LS_session"), Some("S42"));
    }

    #[tokio::test]
    async fn test_send_uses_control_address() {
        let transport = Arc::new(MockTransport::new());
        let channel = channel(transport.clone());

        channel
            .send(&ControlRequest::destroy(), &session(Some("ctrl.example.com")))
            .await
            .unwrap();

        let (endpoint, _) = &transport.control_requests()[0];
        assert_eq!(endpoint.host, "ctrl.example.com");
        assert_eq!(endpoint.port, 8080);
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let transport = Arc::new(MockTransport::new());
        transport.reply_to_control("ERROR,19,unknown table\r\n");

        let err = channel(transport)
            .send(&ControlRequest::unsubscribe(TableId(9)), &session(None))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::Rejected(ServerError::new(19, "unknown table"))
        );
    }

    #[tokio::test]
    async fn test_send_transport_failure_and_garbage() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_control(TransportError::ConnectionClosed);
        transport.reply_to_control("<html>busy</html>");
        let channel = channel(transport);

        let err = channel
            .send(&ControlRequest::destroy(), &session(None))
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::Transport(TransportError::ConnectionClosed));

        let err = channel
            .send(&ControlRequest::destroy(), &session(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let transport = Arc::new(MockTransport::new());
        transport.set_control_delay(Duration::from_secs(5));

        let err = channel(transport)
            .send(&ControlRequest::destroy(), &session(None))
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::Timeout(Duration::from_millis(200)));
    }
}
