//! Low-level websocket transport for element streams.
//!
//! A background worker owns the socket: it performs the handshake, sends the
//! [`StreamRequest`] as the first frame, and then forwards raw inbound frames
//! as [`ConnectionEvent`]s until the socket closes, fails, or goes idle.
//! There is no reconnect; a dropped stream is reported to the caller.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::stream::proto::{StreamFrame, StreamRequest};

/// Production websocket endpoint for element streams.
pub const STREAM_ENDPOINT: &str = "wss://api.deckstream.app/ws/canva_request";
/// Local development websocket endpoint.
pub const LOCAL_STREAM_ENDPOINT: &str = "ws://localhost:8000/ws/canva_request";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamClientDefaults;

impl StreamClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
}

#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Bound on TCP/TLS/websocket handshake plus sending the request frame.
    pub connect_timeout: Duration,
    /// Maximum silence between inbound frames before the stream is failed.
    pub idle_timeout: Duration,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamClientDefaults::CONNECT_TIMEOUT,
            idle_timeout: StreamClientDefaults::IDLE_TIMEOUT,
        }
    }
}

/// Entry point for opening element streams.
#[derive(Clone)]
pub struct StreamClient {
    api_key: Option<SecretString>,
    local: bool,
    endpoint_override: Option<String>,
    options: StreamClientOptions,
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClient {
    /// Creates a stream client for the production endpoint.
    pub fn new() -> Self {
        Self {
            api_key: None,
            local: false,
            endpoint_override: None,
            options: StreamClientOptions::default(),
        }
    }

    /// Sends `x-api-key` on the websocket handshake.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit stream endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    pub fn with_options(mut self, options: StreamClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Connects and sends `request` as the first frame.
    ///
    /// Resolves once the request frame is written; inbound frames are then
    /// available from the returned connection.
    pub async fn connect(
        &self,
        request: &StreamRequest,
    ) -> Result<StreamConnection, StreamClientError> {
        let request_text = request.to_text()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let url = self.endpoint().to_string();
        let api_key = self.api_key.clone();
        let options = self.options.clone();

        tokio::spawn(async move {
            stream_connection_worker(
                url,
                api_key,
                request_text,
                options,
                command_rx,
                event_tx,
                ready_tx,
            )
            .await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(StreamConnection::from_channels(
                StreamSender { tx: command_tx },
                event_rx,
            )),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(StreamClientError::Protocol(
                "stream worker stopped before initial connect".to_string(),
            )),
        }
    }

    fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_STREAM_ENDPOINT
        } else {
            STREAM_ENDPOINT
        }
    }
}

/// Opens element streams. Implemented by [`StreamClient`]; sessions and the
/// orchestrator only depend on this seam.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, request: &StreamRequest)
        -> Result<StreamConnection, StreamClientError>;
}

#[async_trait]
impl StreamConnector for StreamClient {
    async fn connect(
        &self,
        request: &StreamRequest,
    ) -> Result<StreamConnection, StreamClientError> {
        StreamClient::connect(self, request).await
    }
}

/// Transport-level happenings forwarded by the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// One inbound data frame, undecoded.
    Frame(StreamFrame),
    /// The socket closed, either by the peer or at the caller's request.
    Closed { code: Option<u16>, reason: String },
    /// The socket failed or went idle.
    Failed(String),
}

/// Open stream: inbound events plus a handle to close the socket.
#[derive(Debug)]
pub struct StreamConnection {
    sender: StreamSender,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl StreamConnection {
    /// Builds a connection from raw channels.
    ///
    /// Useful for custom transports and tests; the session only needs events
    /// in arrival order and a way to request close.
    pub fn from_channels(
        sender: StreamSender,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self { sender, events }
    }

    pub fn sender(&self) -> StreamSender {
        self.sender.clone()
    }

    pub fn split(self) -> (StreamSender, mpsc::UnboundedReceiver<ConnectionEvent>) {
        (self.sender, self.events)
    }

    /// Receives the next transport event.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    Close,
}

/// Cloneable handle for controlling an open stream.
///
/// Dropping every sender also closes the socket.
#[derive(Clone, Debug)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamSender {
    pub fn new(tx: mpsc::UnboundedSender<StreamCommand>) -> Self {
        Self { tx }
    }

    /// Asks the worker to close the socket.
    pub fn close(&self) -> Result<(), StreamClientError> {
        self.tx
            .send(StreamCommand::Close)
            .map_err(|_| StreamClientError::SendQueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Errors produced while establishing a stream.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// Handshake did not finish within the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Command queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// Stream protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

async fn stream_connection_worker(
    url: String,
    api_key: Option<SecretString>,
    request_text: String,
    options: StreamClientOptions,
    mut command_rx: mpsc::UnboundedReceiver<StreamCommand>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ready_tx: oneshot::Sender<Result<(), StreamClientError>>,
) {
    let handshake = open_socket(&url, api_key.as_ref(), request_text);
    let mut socket = match tokio::time::timeout(options.connect_timeout, handshake).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(err)) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
        Err(_) => {
            let _ = ready_tx.send(Err(StreamClientError::ConnectTimeout(
                options.connect_timeout,
            )));
            return;
        }
    };

    debug!(event = "stream_connected", url = %url);
    if ready_tx.send(Ok(())).is_err() {
        let _ = socket.close(None).await;
        return;
    }

    let terminal = loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(StreamCommand::Close) | None => {
                        let _ = socket.close(None).await;
                        break ConnectionEvent::Closed {
                            code: None,
                            reason: "closed by client".to_string(),
                        };
                    }
                }
            }
            inbound = tokio::time::timeout(options.idle_timeout, socket.next()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let _ = event_tx.send(ConnectionEvent::Frame(StreamFrame::Text(text.to_string())));
                    }
                    Ok(Some(Ok(Message::Binary(data)))) => {
                        let _ = event_tx.send(ConnectionEvent::Frame(StreamFrame::Binary(data.to_vec())));
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            break ConnectionEvent::Failed(format!("failed to answer ping: {err}"));
                        }
                    }
                    Ok(Some(Ok(Message::Pong(_)))) | Ok(Some(Ok(Message::Frame(_)))) => {}
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        break match frame {
                            Some(frame) => ConnectionEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.to_string(),
                            },
                            None => ConnectionEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Ok(Some(Err(err))) => break ConnectionEvent::Failed(err.to_string()),
                    Ok(None) => {
                        break ConnectionEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        };
                    }
                    Err(_) => {
                        let _ = socket.close(None).await;
                        break ConnectionEvent::Failed(format!(
                            "no frame received for {:?}",
                            options.idle_timeout
                        ));
                    }
                }
            }
        }
    };

    debug!(event = "stream_disconnected", url = %url, terminal = ?terminal);
    let _ = event_tx.send(terminal);
}

async fn open_socket(
    url: &str,
    api_key: Option<&SecretString>,
    request_text: String,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    StreamClientError,
> {
    let mut request = url.into_client_request()?;
    if let Some(api_key) = api_key {
        let header = api_key.expose_secret().parse()?;
        request.headers_mut().insert("x-api-key", header);
    }

    let (mut socket, _) = connect_async(request).await?;
    socket.send(Message::Text(request_text.into())).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn stream_client_uses_production_endpoint_by_default() {
        let client = StreamClient::new();
        assert_eq!(client.endpoint(), STREAM_ENDPOINT);
    }

    #[test]
    fn stream_client_uses_local_endpoint_when_enabled() {
        let client = StreamClient::new()
            .with_api_key(SecretString::new("test-api-key".to_string()))
            .with_local_mode(true);
        assert_eq!(client.endpoint(), LOCAL_STREAM_ENDPOINT);
    }

    #[test]
    fn stream_client_endpoint_override_takes_precedence() {
        let client = StreamClient::new()
            .with_local_mode(true)
            .with_endpoint("ws://127.0.0.1:4000/ws/canva_request   \n");
        assert_eq!(client.endpoint(), "ws://127.0.0.1:4000/ws/canva_request");
    }

    #[test]
    fn default_options_use_documented_timeouts() {
        let options = StreamClientOptions::default();
        assert_eq!(options.connect_timeout, StreamClientDefaults::CONNECT_TIMEOUT);
        assert_eq!(options.idle_timeout, StreamClientDefaults::IDLE_TIMEOUT);
    }

    #[test]
    fn sender_close_fails_once_worker_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = StreamSender::new(tx);
        assert!(sender.close().is_ok());
        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(
            sender.close(),
            Err(StreamClientError::SendQueueClosed)
        ));
    }

    #[tokio::test]
    async fn connect_to_unreachable_endpoint_fails() {
        let client = StreamClient::new()
            .with_endpoint("ws://127.0.0.1:1/ws/canva_request")
            .with_options(StreamClientOptions {
                connect_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(2),
            });
        let request = StreamRequest::new(
            crate::stream::proto::CardMsg {
                title: "t".to_string(),
                description: "d".to_string(),
            },
            crate::stream::proto::PageDimensionsMsg::new(100.0, 100.0),
        );
        assert!(client.connect(&request).await.is_err());
    }
}
