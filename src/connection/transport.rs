//! Socket abstraction and the WebSocket connector
//!
//! The connection manager never touches tungstenite directly: a `Connector`
//! opens a `Socket`, which is just a pair of frame channels. The WebSocket
//! connector bridges those channels to the network with two pump tasks.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
};

use super::ConnectionError;

/// Frames buffered in each direction before senders wait
const SOCKET_CHANNEL_CAPACITY: usize = 100;

/// Close code used when the server ends the stream without a close frame
pub(crate) const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code for an orderly shutdown
pub(crate) const NORMAL_CLOSURE: u16 = 1000;

/// A single WebSocket frame as seen by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// An open socket
///
/// Dropping `outbound` closes the socket; `inbound` yields `None` once the
/// remote side is gone.
#[derive(Debug)]
pub struct Socket {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl Socket {
    /// Create a connected pair: the `Socket` plus the far end of both channels
    ///
    /// Used by in-process connectors (tests, loopback).
    pub fn pair() -> (Socket, mpsc::Receiver<Frame>, mpsc::Sender<Frame>) {
        let (out_tx, out_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
        (
            Socket {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Everything a connector needs to open the socket
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Full target URL including the model query parameter
    pub url: String,
    pub credential: String,
}

/// Opens sockets to the realtime service
pub trait Connector: Send + Sync + 'static {
    fn open(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Socket, ConnectionError>>;
}

/// Connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Socket, ConnectionError>> {
        Box::pin(open_websocket(request))
    }
}

async fn open_websocket(request: ConnectRequest) -> Result<Socket, ConnectionError> {
    let mut ws_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

    ws_request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", request.credential))
            .map_err(|e| ConnectionError::Authentication(e.to_string()))?,
    );
    ws_request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    log::info!("Transport: opening WebSocket to {}", request.url);

    // Nagle off: slices are small and latency-bound
    let (ws_stream, _response) = connect_async_with_config(ws_request, None, true)
        .await
        .map_err(handshake_error)?;

    let (mut write, mut read) = ws_stream.split();
    let (socket, mut out_rx, in_tx) = Socket::pair();

    // Writer pump: frames from the manager → network
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes),
                Frame::Close { code, reason } => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(close))).await {
                        log::debug!("Transport: close frame not delivered: {}", e);
                    }
                    break;
                }
            };
            if let Err(e) = write.send(message).await {
                log::warn!("Transport: write failed: {}", e);
                break;
            }
        }
        if let Err(e) = write.close().await {
            log::debug!("Transport: error closing WebSocket: {}", e);
        }
        log::debug!("Transport: writer task exiting");
    });

    // Reader pump: network → manager
    tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            let frame = match msg_result {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
                Ok(Message::Close(close)) => {
                    let (code, reason) = close
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    log::info!("Transport: WebSocket closed by server ({})", code);
                    let _ = in_tx.send(Frame::Close { code, reason }).await;
                    break;
                }
                Err(e) => {
                    log::warn!("Transport: WebSocket error: {}", e);
                    break;
                }
                _ => continue, // Ignore ping/pong/raw frames
            };
            if in_tx.send(frame).await.is_err() {
                log::debug!("Transport: inbound channel closed");
                break;
            }
        }
        log::debug!("Transport: reader task exiting");
    });

    Ok(socket)
}

/// Map a failed WebSocket handshake, separating rejected credentials
fn handshake_error(err: WsError) -> ConnectionError {
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            ConnectionError::Authentication(format!(
                "server rejected credential ({})",
                response.status()
            ))
        }
        e => ConnectionError::ConnectionFailed(e.to_string()),
    }
}
