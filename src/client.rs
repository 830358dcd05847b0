//! Realtime client: connection, session, pipeline, and monitor wired together
//!
//! ```text
//! stream_audio ──▶ StreamingPipeline ──▶ SessionTransport ──▶ ConnectionManager
//!                                          (counts sent)            │
//!                  SessionManager ◀── message / error events ───────┘
//! ```

use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, EventKind, ServerMessage,
};
use crate::performance::PerformanceMonitor;
use crate::session::{
    FileSnapshotStore, MemorySnapshotStore, SessionError, SessionEvent, SessionInfo,
    SessionManager, SessionState, SessionStats, Snapshot, SnapshotStore,
};
use crate::settings::Settings;
use crate::streaming::{AudioTransport, StreamingPipeline};

/// Errors surfaced by the client facade
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Connection(ConnectionError),
    Session(SessionError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connection(e) => write!(f, "{}", e),
            ClientError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ConnectionError> for ClientError {
    fn from(e: ConnectionError) -> Self {
        ClientError::Connection(e)
    }
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        ClientError::Session(e)
    }
}

/// Handler for inbound server messages
pub type MessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Audio transport that counts delivered slices on the session
struct SessionTransport {
    connection: ConnectionManager,
    session: SessionManager,
}

impl AudioTransport for SessionTransport {
    fn send_audio(&self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.connection.send_audio(&bytes).await?;
            self.session.increment_messages_sent();
            Ok(())
        })
    }

    fn connect(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(self.connection.connect())
    }
}

/// A realtime translation client
pub struct RealtimeClient {
    connection: ConnectionManager,
    session: SessionManager,
    pipeline: StreamingPipeline,
    monitor: PerformanceMonitor,
    message_handler: Arc<Mutex<Option<MessageHandler>>>,
}

impl RealtimeClient {
    /// Wire a client around an existing connection manager
    ///
    /// Takes over the connection's `Message` and `Error` handler slots; use
    /// `on_message` to observe inbound messages.
    pub fn new(
        settings: &Settings,
        connection: ConnectionManager,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let session = SessionManager::new(store);
        let monitor = PerformanceMonitor::new(settings.performance.clone());
        let transport = Arc::new(SessionTransport {
            connection: connection.clone(),
            session: session.clone(),
        });
        let pipeline =
            StreamingPipeline::new(settings.streaming.clone(), transport, Some(monitor.clone()));

        // Audio flows only while the session is active
        pipeline.pause();
        let gate = pipeline.downgrade();
        session.subscribe(move |event| {
            let SessionEvent::StateChanged { to, .. } = event else {
                return;
            };
            let Some(pipeline) = gate.upgrade() else {
                return;
            };
            if *to == SessionState::Active {
                pipeline.resume();
            } else {
                pipeline.pause();
            }
        });
        let message_handler: Arc<Mutex<Option<MessageHandler>>> = Arc::new(Mutex::new(None));

        let on_message_session = session.clone();
        let slot = message_handler.clone();
        connection.on(EventKind::Message, move |event| {
            let ConnectionEvent::Message(message) = event else {
                return;
            };
            on_message_session.increment_messages_received();
            if message.is_error() {
                on_message_session.increment_error_count();
            }
            let handler = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(handler) = handler {
                handler(message);
            }
        });

        let on_error_session = session.clone();
        connection.on(EventKind::Error, move |event| {
            let ConnectionEvent::Error(err) = event else {
                return;
            };
            match err {
                ConnectionError::ReconnectExhausted(_) => {
                    if let Err(e) = on_error_session.fail_session(&err.to_string()) {
                        log::debug!("Client: session not failed: {}", e);
                    }
                }
                _ => on_error_session.increment_error_count(),
            }
        });

        Self {
            connection,
            session,
            pipeline,
            monitor,
            message_handler,
        }
    }

    /// Client over a real WebSocket, persisting to the user's data directory
    pub fn from_settings(settings: &Settings, credential: &str) -> Result<Self, ConnectionError> {
        let config = settings.connection.to_config(credential)?;
        let store: Arc<dyn SnapshotStore> = match FileSnapshotStore::in_data_dir() {
            Some(store) => Arc::new(store),
            None => {
                log::warn!("Client: no data directory, session snapshots kept in memory");
                Arc::new(MemorySnapshotStore::new())
            }
        };
        Ok(Self::new(settings, ConnectionManager::new(config), store))
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn pipeline(&self) -> &StreamingPipeline {
        &self.pipeline
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Observe inbound server messages, replacing any previous handler
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        *self
            .message_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Start monitoring, connect, and create a session
    ///
    /// The session uses the handshake configuration of the connection.
    pub async fn start(&self) -> Result<SessionInfo, ClientError> {
        self.monitor.init();
        self.connection.connect().await?;
        let config = self.connection.config().handshake().clone();
        Ok(self.session.create_session(config)?)
    }

    /// Send queued audio and commit the server-side buffer
    pub async fn commit(&self) -> Result<(), ClientError> {
        self.pipeline.flush().await;
        self.connection.commit_audio().await?;
        Ok(())
    }

    /// Restore the persisted session, reopening the audio gate if it was active
    pub fn restore(&self) -> Option<Snapshot> {
        let snapshot = self.session.restore_session()?;
        if snapshot.session_info.state == SessionState::Active {
            self.pipeline.resume();
        }
        Some(snapshot)
    }

    /// Pause the session; audio is discarded until `resume()`
    pub fn pause(&self) -> Result<(), ClientError> {
        self.session.pause_session()?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ClientError> {
        self.session.resume_session()?;
        Ok(())
    }

    /// Tear everything down and return the final session stats
    pub fn dispose(&self) -> Option<SessionStats> {
        self.pipeline.pause();
        let stats = match self.session.terminate_session() {
            Ok(stats) => stats,
            Err(e) => {
                log::debug!("Client: {}", e);
                None
            }
        };
        self.connection.disconnect();
        self.monitor.stop();
        log::info!("Client: disposed");
        stats
    }
}
