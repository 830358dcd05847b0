//! Connection manager: one logical socket to the realtime service
//!
//! Manages the WebSocket lifecycle: connect with timeout, handshake,
//! inbound dispatch, and reconnection with exponential backoff.
//!
//! # Connection Flow
//!
//! 1. `connect()` - `Connecting`, open socket, wait for `Connected` or timeout
//! 2. On open - send `session.update` handshake, reset reconnect counter
//! 3. Reader task - parse frames, capture `session.created`, emit events
//! 4. Unexpected close - `Reconnecting`, sleep base × 2^(n−1), retry
//! 5. `disconnect()` - cancel timers, close socket, `Disconnected`
//!
//! Every socket belongs to a *generation*. `disconnect()` and timeouts bump the
//! generation, so late events from an abandoned socket are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::config::ConnectionConfig;
use super::protocol::{ClientMessage, ServerMessage};
use super::transport::{
    ConnectRequest, Connector, Frame, Socket, WebSocketConnector, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};
use super::ConnectionError;

/// State of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// Whether `self → next` is an edge of the connection state machine
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
                | (Error, Connecting)
                | (Error, Reconnecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket opened and handshake sent
    Open,
    /// Parsed inbound message
    Message(ServerMessage),
    /// Socket closed (by either side)
    Close { code: u16, reason: String },
    /// Connection-level or parse error
    Error(ConnectionError),
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Discriminant of `ConnectionEvent`, used as the handler key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Close,
    Error,
    StateChange,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Open => EventKind::Open,
            ConnectionEvent::Message(_) => EventKind::Message,
            ConnectionEvent::Close { .. } => EventKind::Close,
            ConnectionEvent::Error(_) => EventKind::Error,
            ConnectionEvent::StateChange { .. } => EventKind::StateChange,
        }
    }
}

/// Handler invoked for one event kind
pub type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Mutable link state, guarded by a mutex that is never held across `.await`
#[derive(Default)]
struct Link {
    /// Write half of the current socket
    outbound: Option<mpsc::Sender<Frame>>,
    reader_task: Option<JoinHandle<()>>,
    /// In-flight socket open
    attempt_task: Option<JoinHandle<()>>,
    /// Pending backoff timer (and the retry it will run)
    reconnect_task: Option<JoinHandle<()>>,
    reconnect_count: u32,
    remote_session_id: Option<String>,
    generation: u64,
    last_error: Option<ConnectionError>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    handlers: Mutex<HashMap<EventKind, EventHandler>>,
}

/// Handle to the connection manager
///
/// Cheap to clone; all clones drive the same socket.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager that connects over a real WebSocket
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Create a manager with a custom connector
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state_tx,
                link: Mutex::new(Link::default()),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_count(&self) -> u32 {
        self.link().reconnect_count
    }

    /// Error behind the most recent failed attempt or exhausted retry
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.link().last_error.clone()
    }

    /// Session id assigned by the server in `session.created`
    pub fn remote_session_id(&self) -> Option<String> {
        self.link().remote_session_id.clone()
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.handlers().insert(kind, Arc::new(handler));
    }

    /// Detach the handler for `kind`
    pub fn off(&self, kind: EventKind) {
        self.handlers().remove(&kind);
    }

    /// Connect to the realtime service
    ///
    /// Returns immediately if already connected, connecting, or waiting on a
    /// scheduled reconnect. Otherwise waits until the socket is open and the
    /// handshake has been sent, or until the connection timeout elapses.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => {
                log::debug!("Connection: connect() ignored in state {}", self.state());
                Ok(())
            }
            ConnectionState::Disconnected | ConnectionState::Error => self.attempt().await,
        }
    }

    /// Close the connection and cancel any pending attempt or reconnect
    ///
    /// Idempotent; never fails. The reconnect counter is left untouched.
    pub fn disconnect(&self) {
        let had_socket = {
            let mut link = self.link();
            link.generation += 1;
            for task in [
                link.reconnect_task.take(),
                link.attempt_task.take(),
                link.reader_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            link.remote_session_id = None;
            match link.outbound.take() {
                Some(outbound) => {
                    let _ = outbound.try_send(Frame::Close {
                        code: NORMAL_CLOSURE,
                        reason: "client disconnect".to_string(),
                    });
                    true
                }
                None => false,
            }
        };

        if had_socket {
            log::info!("Connection: disconnected");
            self.emit(ConnectionEvent::Close {
                code: NORMAL_CLOSURE,
                reason: "client disconnect".to_string(),
            });
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Serialize and send a client message
    pub async fn send(&self, message: &ClientMessage) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = self
            .link()
            .outbound
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        let json = serde_json::to_string(message)
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;

        outbound
            .send(Frame::Text(json))
            .await
            .map_err(|_| ConnectionError::SendFailed("socket closed".to_string()))
    }

    /// Send PCM16 audio bytes as an `input_audio_buffer.append`
    pub async fn send_audio(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.send(&ClientMessage::audio_append(bytes)).await
    }

    /// Commit the server-side audio buffer
    pub async fn commit_audio(&self) -> Result<(), ConnectionError> {
        self.send(&ClientMessage::audio_commit()).await
    }

    /// Clear the server-side audio buffer without committing
    pub async fn clear_audio(&self) -> Result<(), ConnectionError> {
        self.send(&ClientMessage::audio_clear()).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn link(&self) -> MutexGuard<'_, Link> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<EventKind, EventHandler>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // Clone the handler out so it runs without the lock held
        let handler = self.handlers().get(&event.kind()).cloned();
        if let Some(handler) = handler {
            handler(&event);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            log::warn!("Connection: unexpected transition {} -> {}", previous, next);
        }
        log::debug!("Connection: {} -> {}", previous, next);
        self.emit(ConnectionEvent::StateChange {
            from: previous,
            to: next,
        });
    }

    /// One connection attempt, bounded by the connection timeout
    ///
    /// Boxed because retries re-enter it from spawned reconnect tasks.
    fn attempt(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            let config = &self.inner.config;
            let mut state_rx = self.inner.state_tx.subscribe();
            self.set_state(ConnectionState::Connecting);

            let request = ConnectRequest {
                url: config.target_url(),
                credential: config.credential().to_string(),
            };
            let open = self.inner.connector.open(request);

            {
                let mut link = self.link();
                link.generation += 1;
                link.last_error = None;
                let generation = link.generation;

                let this = self.clone();
                let task = tokio::spawn(async move {
                    match open.await {
                        Ok(socket) => this.handle_open(generation, socket).await,
                        Err(e) => this.handle_attempt_error(generation, e),
                    }
                });
                if let Some(previous) = link.attempt_task.replace(task) {
                    previous.abort();
                }
            }

            log::info!("Connection: connecting to {}", config.target_url());

            let outcome = timeout(config.connection_timeout(), async {
                state_rx
                    .wait_for(|s| *s != ConnectionState::Connecting)
                    .await
                    .map(|s| *s)
            })
            .await;

            match outcome {
                Ok(Ok(ConnectionState::Connected)) => Ok(()),
                Ok(Ok(ConnectionState::Error)) => Err(self
                    .link()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| ConnectionError::ConnectionFailed("unknown error".into()))),
                Ok(Ok(_)) => Err(ConnectionError::ConnectionFailed(
                    "connection attempt cancelled".to_string(),
                )),
                Ok(Err(_)) => Err(ConnectionError::ConnectionFailed(
                    "state channel closed".to_string(),
                )),
                Err(_) => {
                    let err =
                        ConnectionError::Timeout(config.connection_timeout().as_millis() as u64);
                    log::warn!("Connection: {}", err);
                    self.teardown_attempt(err.clone());
                    self.set_state(ConnectionState::Error);
                    self.emit(ConnectionEvent::Error(err.clone()));
                    Err(err)
                }
            }
        })
    }

    /// Abandon the current attempt and any socket it may have produced
    fn teardown_attempt(&self, err: ConnectionError) {
        let mut link = self.link();
        link.generation += 1;
        link.last_error = Some(err);
        if let Some(task) = link.attempt_task.take() {
            task.abort();
        }
        if let Some(task) = link.reader_task.take() {
            task.abort();
        }
        link.outbound = None;
    }

    async fn handle_open(&self, generation: u64, socket: Socket) {
        let Socket { outbound, inbound } = socket;

        // Handshake goes out before anyone can observe `Connected`
        let handshake = ClientMessage::session_update(self.inner.config.handshake().clone());
        let sent = match serde_json::to_string(&handshake) {
            Ok(json) => outbound
                .send(Frame::Text(json))
                .await
                .map_err(|_| ConnectionError::SendFailed("socket closed during handshake".into())),
            Err(e) => Err(ConnectionError::Protocol(e.to_string())),
        };
        if let Err(e) = sent {
            self.handle_attempt_error(generation, e);
            return;
        }

        {
            let mut link = self.link();
            if link.generation != generation {
                log::debug!("Connection: dropping socket from stale attempt");
                return;
            }
            link.outbound = Some(outbound);
            link.reconnect_count = 0;
            link.attempt_task = None;
            let this = self.clone();
            link.reader_task = Some(tokio::spawn(this.read_loop(generation, inbound)));
        }

        log::info!("Connection: connected, handshake sent");
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Open);
    }

    fn handle_attempt_error(&self, generation: u64, err: ConnectionError) {
        {
            let mut link = self.link();
            if link.generation != generation {
                return;
            }
            link.last_error = Some(err.clone());
            link.attempt_task = None;
        }
        log::warn!("Connection: attempt failed: {}", err);
        self.set_state(ConnectionState::Error);
        self.emit(ConnectionEvent::Error(err));
    }

    async fn read_loop(self, generation: u64, mut inbound: mpsc::Receiver<Frame>) {
        let (code, reason) = loop {
            match inbound.recv().await {
                Some(Frame::Text(text)) => self.dispatch_text(&text),
                Some(Frame::Binary(bytes)) => {
                    log::debug!("Connection: ignoring {} byte binary frame", bytes.len());
                }
                Some(Frame::Close { code, reason }) => break (code, reason),
                None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
            }
        };
        self.handle_close(generation, code, reason);
    }

    fn dispatch_text(&self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(message) => {
                if let ServerMessage::SessionCreated { session } = &message {
                    log::info!("Connection: remote session created: {}", session.id);
                    self.link().remote_session_id = Some(session.id.clone());
                }
                if let Some(error) = message.error_info() {
                    log::warn!(
                        "Connection: server error {} ({:?}): {}",
                        error.error_type,
                        error.code,
                        error.message
                    );
                }
                self.emit(ConnectionEvent::Message(message));
            }
            Err(e) => {
                log::warn!("Connection: failed to parse message: {}", e);
                self.emit(ConnectionEvent::Error(ConnectionError::Parse(e)));
            }
        }
    }

    fn handle_close(&self, generation: u64, code: u16, reason: String) {
        {
            let mut link = self.link();
            if link.generation != generation {
                return;
            }
            link.outbound = None;
            link.reader_task = None;
            link.remote_session_id = None;
        }

        log::info!("Connection: socket closed ({}: {})", code, reason);
        self.emit(ConnectionEvent::Close { code, reason });

        if code == NORMAL_CLOSURE {
            self.set_state(ConnectionState::Disconnected);
        } else {
            self.schedule_reconnect();
        }
    }

    /// Close handler for unexpected closes and failed retries
    fn schedule_reconnect(&self) {
        let max_attempts = self.inner.config.max_reconnect_attempts();
        let next = {
            let mut link = self.link();
            if link.reconnect_count >= max_attempts {
                None
            } else {
                link.reconnect_count += 1;
                Some(link.reconnect_count)
            }
        };

        let Some(attempt) = next else {
            let err = ConnectionError::ReconnectExhausted(max_attempts);
            log::error!("Connection: {}", err);
            self.link().last_error = Some(err.clone());
            self.set_state(ConnectionState::Error);
            self.emit(ConnectionEvent::Error(err));
            return;
        };

        let delay = self.inner.config.backoff_delay(attempt);
        log::info!(
            "Connection: reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            max_attempts
        );
        self.set_state(ConnectionState::Reconnecting);

        let this = self.clone();
        let mut link = self.link();
        link.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match this.attempt().await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    log::warn!("Connection: reconnect attempt {} failed: {}", attempt, e);
                    this.schedule_reconnect();
                }
                Err(e) => {
                    log::error!("Connection: giving up on reconnect: {}", e);
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const KEY: &str = "sk-test_0123456789abcdefghij";

    /// Connector handing out in-process sockets; far ends are kept for the test
    #[derive(Default)]
    struct LoopbackConnector {
        ends: Mutex<Vec<(mpsc::Receiver<Frame>, mpsc::Sender<Frame>)>>,
    }

    impl Connector for LoopbackConnector {
        fn open(&self, _request: ConnectRequest) -> BoxFuture<'static, Result<Socket, ConnectionError>> {
            let (socket, far_rx, far_tx) = Socket::pair();
            self.ends.lock().unwrap().push((far_rx, far_tx));
            Box::pin(async move { Ok(socket) })
        }
    }

    /// Connector whose open never completes
    struct HangingConnector;

    impl Connector for HangingConnector {
        fn open(&self, _request: ConnectRequest) -> BoxFuture<'static, Result<Socket, ConnectionError>> {
            Box::pin(futures_util::future::pending())
        }
    }

    /// Connector whose first open succeeds and later opens are refused
    #[derive(Default)]
    struct RevokedConnector {
        opens: AtomicUsize,
        far_ends: Mutex<Vec<mpsc::Receiver<Frame>>>,
    }

    impl Connector for RevokedConnector {
        fn open(&self, _request: ConnectRequest) -> BoxFuture<'static, Result<Socket, ConnectionError>> {
            if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
                return Box::pin(async {
                    Err(ConnectionError::Authentication("revoked".to_string()))
                });
            }
            // Far sender dropped: the socket closes abnormally once read
            let (socket, far_rx, _far_tx) = Socket::pair();
            self.far_ends.lock().unwrap().push(far_rx);
            Box::pin(async move { Ok(socket) })
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("wss://example.test/v1/realtime", KEY, "test-model")
            .unwrap()
            .with_connection_timeout(Duration::from_millis(500))
    }

    #[test]
    fn test_state_machine_edges() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let manager = ConnectionManager::with_connector(config(), Arc::new(LoopbackConnector::default()));

        let result = manager.send(&ClientMessage::audio_commit()).await;
        assert_eq!(result, Err(ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = ConnectionManager::with_connector(config(), Arc::new(LoopbackConnector::default()));
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        manager.on(EventKind::StateChange, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.disconnect();
        manager.disconnect();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_surfaces_error() {
        let manager = ConnectionManager::with_connector(config(), Arc::new(HangingConnector));
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        manager.on(EventKind::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = manager.connect().await;

        assert_eq!(result, Err(ConnectionError::Timeout(500)));
        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_stops_on_rejected_credential() {
        let connector = Arc::new(RevokedConnector::default());
        let manager = ConnectionManager::with_connector(
            config().with_reconnect(5, Duration::from_secs(1)),
            connector.clone(),
        );

        manager.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(manager.reconnect_count(), 1);
        assert!(matches!(
            manager.last_error(),
            Some(ConnectionError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_replacement_and_removal() {
        let manager = ConnectionManager::with_connector(config(), Arc::new(LoopbackConnector::default()));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        manager.on(EventKind::StateChange, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = second.clone();
        manager.on(EventKind::StateChange, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        manager.connect().await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2); // connecting, connected

        manager.off(EventKind::StateChange);
        manager.disconnect();
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }
}
