//! Session manager

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::listener::{Dispatcher, SessionListener};
use super::worker::{open_session, shutdown_signalled, Command, HandshakeFailure, Worker};
use super::{Phase, SessionInfo};
use crate::config::{ClientConfig, Credentials};
use crate::control::{ControlChannel, ControlRequest};
use crate::error::{ControlError, Result, SessionError};
use crate::protocol::{Request, ServerError, SessionHeader};
use crate::subscription::{MaxFrequency, Subscription, TableId};
use crate::transport::Transport;

/// Handles of the session created by the latest `create()`
struct ActiveSession {
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Default)]
struct State {
    /// Bumped by every `create()`; work of older sessions is ignored
    generation: u64,
    session: Option<SessionInfo>,
    last_error: Option<SessionError>,
    active: Option<ActiveSession>,
    subscriptions: BTreeMap<TableId, Subscription>,
    next_table: u32,
}

/// State shared by the manager handles and the worker task
///
/// Every phase change happens under the `state` lock, and the lock is never
/// held across an await point or while a listener callback runs.
pub(crate) struct Shared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    control: ControlChannel,
    phase: watch::Sender<Phase>,
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// End the session with `error` unless it already ended
    pub(crate) fn fail(&self, generation: u64, dispatcher: &Dispatcher, error: SessionError) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || self.phase().is_terminal() {
                return;
            }
            state.last_error = Some(error.clone());
            self.phase.send_replace(Phase::Failed);
        }
        error!("Session failed: {}", error);
        dispatcher.finish(|l| l.on_session_failed(&error));
    }

    /// The server ended the session with `END`
    pub(crate) fn close_by_server(
        &self,
        generation: u64,
        dispatcher: &Dispatcher,
        cause: Option<ServerError>,
    ) {
        {
            let state = self.state.lock();
            if state.generation != generation || self.phase().is_terminal() {
                return;
            }
            self.phase.send_replace(Phase::Closed);
        }
        match &cause {
            Some(cause) => info!(code = cause.code, "Session closed by server: {}", cause.message),
            None => info!("Session closed by server"),
        }
        dispatcher.finish(|l| l.on_stream_closed());
    }

    /// Move to `Rebinding`; returns the session identifier to bind
    pub(crate) fn enter_rebinding(&self, generation: u64) -> Option<String> {
        let state = self.state.lock();
        if state.generation != generation || self.phase().is_terminal() {
            return None;
        }
        let session_id = state.session.as_ref()?.session_id.clone();
        self.phase.send_replace(Phase::Rebinding);
        Some(session_id)
    }

    /// Record a successful bind and move back to `Streaming`
    pub(crate) fn complete_rebind(&self, generation: u64, header: SessionHeader) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || self.phase() != Phase::Rebinding {
            return false;
        }
        match state.session.as_mut() {
            Some(session) => session.rebound(header),
            None => return false,
        }
        self.phase.send_replace(Phase::Streaming);
        true
    }

    /// Stop the active session without waiting for anything.
    ///
    /// Returns the session to destroy on the server, if there was one.
    fn close(&self) -> Option<Option<SessionInfo>> {
        let (dispatcher, session) = {
            let mut state = self.state.lock();
            let phase = self.phase();
            if phase == Phase::Idle || phase.is_terminal() {
                return None;
            }
            let active = state.active.as_ref()?;
            active.shutdown.send_replace(true);
            let dispatcher = active.dispatcher.clone();
            self.phase.send_replace(Phase::Closed);
            (dispatcher, state.session.take())
        };
        dispatcher.finish(|l| l.on_stream_closed());
        Some(session)
    }

    /// Keep-alive interval granted to the session of `generation`
    pub(crate) fn granted_keepalive(&self, generation: u64) -> Option<Duration> {
        let state = self.state.lock();
        if state.generation != generation {
            return None;
        }
        state.session.as_ref().and_then(|s| s.keepalive)
    }

    fn bound_session(&self) -> std::result::Result<(u64, SessionInfo), ControlError> {
        let state = self.state.lock();
        if self.phase().is_terminal() {
            return Err(ControlError::NoSession);
        }
        let session = state.session.clone().ok_or(ControlError::NoSession)?;
        Ok((state.generation, session))
    }
}

/// Fails a `create()` whose future is dropped before the handshake ends
struct PendingCreate<'a> {
    shared: &'a Shared,
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    armed: bool,
}

impl PendingCreate<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.phase() == Phase::Creating {
            debug!("Create abandoned by caller");
            self.shared
                .fail(self.generation, &self.dispatcher, SessionError::Cancelled);
        }
    }
}

/// Stops the session when the last [`SessionManager`] handle is dropped
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(Some(session)) = self.shared.close() {
            // Best-effort destroy; needs a runtime to run on
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let control = self.shared.control.clone();
                handle.spawn(async move {
                    if let Err(e) = control.send(&ControlRequest::destroy(), &session).await {
                        debug!("Destroy on drop failed: {}", e);
                    }
                });
            }
        }
    }
}

/// Creates and drives one streaming session at a time
///
/// Cheap to clone; all clones control the same session. The session is
/// closed when the last clone is dropped.
///
/// ```ignore
/// let manager = SessionManager::new(config, Arc::new(HttpTransport::default()));
/// let info = manager.create(Credentials::anonymous(), listener).await?;
/// let table = manager.subscribe(Subscription::merge(["item1"], ["last"])).await?;
/// // ...
/// manager.disconnect().await;
/// ```
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl SessionManager {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let control = ControlChannel::new(
            transport.clone(),
            config.endpoint.clone(),
            config.control_timeout(),
        );
        let (phase, _) = watch::channel(Phase::Idle);
        let shared = Arc::new(Shared {
            config,
            transport,
            control,
            phase,
            state: Mutex::new(State::default()),
        });
        Self {
            _owner: Arc::new(Owner {
                shared: shared.clone(),
            }),
            shared,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Receiver notified of every phase change
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    /// Snapshot of the current session, if one is established
    pub fn session(&self) -> Option<SessionInfo> {
        self.shared.state.lock().session.clone()
    }

    /// The error that moved the session to `Failed`
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.state.lock().last_error.clone()
    }

    /// Wait until the session is `Closed` or `Failed`
    pub async fn wait_for_terminal(&self) -> Phase {
        let mut phase = self.shared.phase.subscribe();
        loop {
            let current = *phase.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if phase.changed().await.is_err() {
                return *phase.borrow();
            }
        }
    }

    /// Create a new session and start streaming.
    ///
    /// Allowed when no session is running (`Idle`, `Closed` or `Failed`).
    /// Returns once the server accepted the session; events then flow to
    /// `listener` from a background task. A rejection moves the manager to
    /// `Failed` and is also reported through `on_session_error`. Dropping
    /// the returned future before it completes also moves the manager to
    /// `Failed`, with [`SessionError::Cancelled`].
    #[instrument(skip(self, credentials, listener), fields(adapter_set = %self.shared.config.adapter_set))]
    pub async fn create(
        &self,
        credentials: Credentials,
        listener: Arc<dyn SessionListener>,
    ) -> Result<SessionInfo> {
        let shared = &self.shared;
        let config = &shared.config;

        let (generation, dispatcher, mut shutdown, commands) = {
            let mut state = shared.state.lock();
            let phase = shared.phase();
            if phase != Phase::Idle && !phase.is_terminal() {
                return Err(SessionError::InvalidState(phase));
            }

            state.generation += 1;
            state.session = None;
            state.last_error = None;
            state.subscriptions.clear();
            state.next_table = 0;

            let dispatcher = Arc::new(Dispatcher::new(listener));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            state.active = Some(ActiveSession {
                generation: state.generation,
                dispatcher: dispatcher.clone(),
                shutdown: shutdown_tx,
                commands: commands_tx,
            });
            shared.phase.send_replace(Phase::Creating);
            (state.generation, dispatcher, shutdown_rx, commands_rx)
        };

        let mut pending = PendingCreate {
            shared: shared.as_ref(),
            generation,
            dispatcher: dispatcher.clone(),
            armed: true,
        };

        info!(endpoint = %config.endpoint, "Creating session");
        let request = Request::create_session(&config.adapter_set, &credentials, &config.options);

        let handshake = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => None,
            result = open_session(
                shared.transport.as_ref(),
                &config.endpoint,
                &request,
                config.connect_timeout(),
                config.max_line_length,
            ) => Some(result),
        };
        pending.disarm();

        let (reader, header) = match handshake {
            None => {
                debug!("Create abandoned by disconnect");
                return Err(SessionError::Cancelled);
            }
            Some(Ok(opened)) => opened,
            Some(Err(HandshakeFailure::Rejected(error))) => {
                warn!(code = error.code, "Session rejected: {}", error.message);
                dispatcher.dispatch(|l| l.on_session_error(error.code, &error.message));
                let error = SessionError::CreationRejected(error);
                shared.fail(generation, &dispatcher, error.clone());
                return Err(error);
            }
            Some(Err(HandshakeFailure::Failed(error))) => {
                shared.fail(generation, &dispatcher, error.clone());
                return Err(error);
            }
        };

        let info = SessionInfo::created(header, &config.adapter_set);
        {
            let mut state = shared.state.lock();
            if state.generation != generation || shared.phase() != Phase::Creating {
                drop(state);
                reader.close();
                return Err(SessionError::Cancelled);
            }
            state.session = Some(info.clone());
            shared.phase.send_replace(Phase::Streaming);
        }

        info!(session_id = %info.session_id, "Session created");
        dispatcher.dispatch(|l| l.on_session_created(&info));

        let worker = Worker::new(shared.clone(), generation, dispatcher, shutdown, commands);
        tokio::spawn(worker.run(reader));

        Ok(info)
    }

    /// Drop the current stream connection and bind the session again now.
    ///
    /// Works whether or not automatic rebinding is enabled; the attempt
    /// bound of the rebind policy still applies.
    pub fn bind(&self) -> Result<()> {
        let state = self.shared.state.lock();
        let phase = self.shared.phase();
        if phase != Phase::Streaming {
            return Err(SessionError::InvalidState(phase));
        }
        let active = state
            .active
            .as_ref()
            .filter(|a| a.generation == state.generation)
            .ok_or(SessionError::InvalidState(phase))?;
        active
            .commands
            .send(Command::Rebind)
            .map_err(|_| SessionError::InvalidState(phase))
    }

    /// Close the session.
    ///
    /// The phase becomes `Closed` before this returns its first await, the
    /// listener gets one final `on_stream_closed`, and the stream connection
    /// (or a rebind in progress) is abandoned. The server is then asked to
    /// destroy the session; failures of that request are only logged.
    /// Does nothing when no session is running.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let session = match self.shared.close() {
            Some(session) => session,
            None => {
                debug!("No session to disconnect");
                return;
            }
        };
        info!("Session closed");

        if let Some(session) = session {
            if let Err(e) = self
                .shared
                .control
                .send(&ControlRequest::destroy(), &session)
                .await
            {
                warn!("Failed to destroy session {}: {}", session.session_id, e);
            }
        }
    }

    /// Send a control request for the current session
    pub async fn send_control(&self, request: &ControlRequest) -> std::result::Result<(), ControlError> {
        let (_, session) = self.shared.bound_session()?;
        self.shared.control.send(request, &session).await
    }

    /// Add a subscription; returns the table it lives in
    #[instrument(skip(self, subscription), fields(group = %subscription.group()))]
    pub async fn subscribe(
        &self,
        subscription: Subscription,
    ) -> std::result::Result<TableId, ControlError> {
        let (generation, session) = self.shared.bound_session()?;
        let table = {
            let mut state = self.shared.state.lock();
            state.next_table += 1;
            TableId(state.next_table)
        };

        self.shared
            .control
            .send(&ControlRequest::subscribe(table, &subscription), &session)
            .await?;

        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.subscriptions.insert(table, subscription);
        }
        info!(%table, "Subscribed");
        Ok(table)
    }

    /// Remove a subscription
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, table: TableId) -> std::result::Result<(), ControlError> {
        let (_, session) = self.shared.bound_session()?;
        self.ensure_table(table)?;

        self.shared
            .control
            .send(&ControlRequest::unsubscribe(table), &session)
            .await?;

        self.shared.state.lock().subscriptions.remove(&table);
        info!(%table, "Unsubscribed");
        Ok(())
    }

    /// Change the update rate requested for a table
    #[instrument(skip(self))]
    pub async fn change_frequency(
        &self,
        table: TableId,
        frequency: MaxFrequency,
    ) -> std::result::Result<(), ControlError> {
        let (_, session) = self.shared.bound_session()?;
        self.ensure_table(table)?;

        self.shared
            .control
            .send(&ControlRequest::modify_rate(table, frequency), &session)
            .await?;

        if let Some(subscription) = self.shared.state.lock().subscriptions.get_mut(&table) {
            subscription.max_frequency = Some(frequency);
        }
        Ok(())
    }

    /// Subscriptions of the current session, by table
    pub fn subscriptions(&self) -> Vec<(TableId, Subscription)> {
        self.shared
            .state
            .lock()
            .subscriptions
            .iter()
            .map(|(table, sub)| (*table, sub.clone()))
            .collect()
    }

    pub fn subscription(&self, table: TableId) -> Option<Subscription> {
        self.shared.state.lock().subscriptions.get(&table).cloned()
    }

    fn ensure_table(&self, table: TableId) -> std::result::Result<(), ControlError> {
        if self.shared.state.lock().subscriptions.contains_key(&table) {
            Ok(())
        } else {
            Err(ControlError::UnknownTable(table))
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("endpoint", &self.shared.config.endpoint)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::testing::{ListenerEvent, RecordingListener};
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;

    fn manager(transport: Arc<MockTransport>) -> SessionManager {
        let config = ClientConfig::new(Endpoint::new("localhost", 8080, false), "QUOTES");
        SessionManager::new(config, transport)
    }

    #[tokio::test]
    async fn test_new_manager_is_idle() {
        let manager = manager(Arc::new(MockTransport::new()));
        assert_eq!(manager.phase(), Phase::Idle);
        assert!(manager.session().is_none());
        assert!(manager.last_error().is_none());

        // Nothing to close yet
        manager.disconnect().await;
        assert_eq!(manager.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_bind_requires_streaming() {
        let manager = manager(Arc::new(MockTransport::new()));
        assert_eq!(
            manager.bind(),
            Err(SessionError::InvalidState(Phase::Idle))
        );
    }

    #[tokio::test]
    async fn test_control_without_session() {
        let manager = manager(Arc::new(MockTransport::new()));
        assert_eq!(
            manager.subscribe(Subscription::merge(["a"], ["b"])).await,
            Err(ControlError::NoSession)
        );
        assert_eq!(
            manager.send_control(&ControlRequest::destroy()).await,
            Err(ControlError::NoSession)
        );
    }

    #[tokio::test]
    async fn test_create_sends_credentials_and_adapter_set() {
        let transport = Arc::new(MockTransport::new());
        let conn = transport.expect_connection();
        conn.accept_session("S1");
        let manager = manager(transport.clone());
        let listener = Arc::new(RecordingListener::new());

        let info = manager
            .create(Credentials::new("alice", "secret"), listener.clone())
            .await
            .unwrap();

        assert_eq!(info.session_id, "S1");
        assert_eq!(info.adapter_set, "QUOTES");
        let request = &transport.stream_requests()[0];
        assert_eq!(request.param("LS_adapter_set"), Some("QUOTES"));
        assert_eq!(request.param("LS_user"), Some("alice"));
        assert_eq!(request.param("LS_password"), Some("secret"));
        assert_eq!(listener.events(), vec![ListenerEvent::SessionCreated("S1".into())]);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_create_while_streaming_is_refused() {
        let transport = Arc::new(MockTransport::new());
        transport.expect_connection().accept_session("S1");
        let manager = manager(transport);
        let listener = Arc::new(RecordingListener::new());

        manager
            .create(Credentials::anonymous(), listener.clone())
            .await
            .unwrap();
        let err = manager
            .create(Credentials::anonymous(), listener)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::InvalidState(Phase::Streaming));

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_session() {
        let transport = Arc::new(MockTransport::new());
        let conn = transport.expect_connection();
        conn.accept_session("S1");
        let listener = Arc::new(RecordingListener::new());

        let manager = manager(transport.clone());
        let observer = manager.watch_phase();
        manager
            .create(Credentials::anonymous(), listener.clone())
            .await
            .unwrap();

        let clone = manager.clone();
        drop(manager);
        assert_eq!(*observer.borrow(), Phase::Streaming);

        drop(clone);
        assert_eq!(*observer.borrow(), Phase::Closed);
        assert_eq!(listener.events().last(), Some(&ListenerEvent::StreamClosed));
    }
}
