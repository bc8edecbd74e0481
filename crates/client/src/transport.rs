//! Transport seam between the connection loop and the socket.
//!
//! [`Connector`] performs the handshake and yields a [`Transport`] that
//! moves text frames. [`WsConnector`] is the production implementation
//! over `tokio-tungstenite`; tests plug in an in-memory connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// An inbound frame the connection loop cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A protocol envelope.
    Text(String),
    /// A transport-level pong (counts as a heartbeat reply).
    Pong,
    /// The peer closed the socket.
    Close,
}

/// An open, bidirectional stream of text frames.
///
/// `next_frame` must be cancel safe: it is raced against timers and
/// outbound commands in a `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next frame, or `None` once the stream is exhausted.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Best-effort close handshake.
    async fn close(&mut self);
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint_url: &str,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Socket-level failure. Drives the reconnect state machine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Connection closed")]
    Closed,
}

/// Failure to establish a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The server refused us (auth failure, bad URL, 4xx upgrade
    /// response). Not retried.
    #[error("Handshake rejected: {0}")]
    Handshake(String),

    /// A transient failure; retried with backoff.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

/// A live WebSocket connection to a job stream endpoint.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint_url: &str,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let mut request = endpoint_url
            .into_client_request()
            .map_err(|e| ConnectError::Handshake(format!("Invalid endpoint {endpoint_url}: {e}")))?;

        if let Some(token) = auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ConnectError::Handshake(format!("Invalid auth token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request).await.map_err(classify_error)?;

        tracing::info!(endpoint = %endpoint_url, "Connected to job stream");

        Ok(Box::new(WsTransport { stream }))
    }
}

/// Split handshake failures into rejections (no retry) and transient
/// transport faults (retry).
fn classify_error(error: tungstenite::Error) -> ConnectError {
    match &error {
        tungstenite::Error::Http(response) if is_rejection(response.status()) => {
            ConnectError::Handshake(format!("Server responded {}", response.status()))
        }
        tungstenite::Error::Url(e) => ConnectError::Handshake(format!("Invalid URL: {e}")),
        _ => ConnectError::Transport(TransportError::WebSocket(error)),
    }
}

fn is_rejection(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Pong(_)) => return Some(Ok(Frame::Pong)),
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "Job stream closed by server");
                    return Some(Ok(Frame::Close));
                }
                Ok(Message::Binary(data)) => {
                    tracing::trace!(len = data.len(), "Ignoring binary frame");
                }
                Ok(Message::Ping(_) | Message::Frame(_)) => {
                    // Ping replies are queued by tungstenite itself.
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error while closing job stream");
        }
    }
}
