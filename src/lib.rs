//! Realtime speech/translation client
//!
//! - `connection` keeps one WebSocket to the remote service alive
//! - `session` tracks the logical session lifecycle and persists it
//! - `streaming` slices, queues, and paces outbound audio
//! - `performance` pools sample buffers and samples resource usage
//! - `client` wires them together

pub mod client;
pub mod connection;
pub mod logging;
pub mod performance;
pub mod session;
pub mod settings;
pub mod streaming;

pub use client::{ClientError, RealtimeClient};
pub use connection::{ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState};
pub use session::{SessionManager, SessionState};
pub use settings::Settings;
pub use streaming::{StreamingConfig, StreamingPipeline};
