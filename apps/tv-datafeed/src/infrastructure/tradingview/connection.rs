//! Connection Management
//!
//! [`ConnectionManager`] opens one connection per fetch attempt through a
//! [`Connector`], retrying the open with the shared [`RetryPolicy`]. The
//! returned [`ManagedConnection`] applies a per-receive timeout and must be
//! released with [`ManagedConnection::close`].
//!
//! [`WsConnector`] is the tokio-tungstenite adapter used in production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Connection, Connector, Endpoint, TransportError};
use crate::application::services::retry::RetryPolicy;
use crate::infrastructure::metrics;

/// Default chart WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://data.tradingview.com/socket.io/websocket";

/// Origin header the endpoint expects.
pub const DEFAULT_ORIGIN: &str = "https://data.tradingview.com";

/// Connection timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Where to connect.
    pub endpoint: Endpoint,
    /// Limit for a single open.
    pub connect_timeout: Duration,
    /// Limit for a single receive.
    pub receive_timeout: Duration,
    /// Open attempts and the delay between them.
    pub connect_retry: RetryPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new(DEFAULT_WS_URL).with_header("Origin", DEFAULT_ORIGIN),
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            connect_retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Opens connections with bounded retries.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        Self {
            connector,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop waiting between open attempts when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Open a connection, retrying failed or timed-out opens.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Exhausted`] once every attempt has failed.
    pub async fn open(&self) -> Result<ManagedConnection, TransportError> {
        let endpoint = &self.settings.endpoint;
        let connect_timeout = self.settings.connect_timeout;

        let opened = self
            .settings
            .connect_retry
            .run(
                &self.cancel,
                |attempt| async move {
                    tracing::debug!(url = %endpoint.url, attempt = %attempt, "Opening WebSocket");
                    tokio::time::timeout(connect_timeout, self.connector.connect(endpoint))
                        .await
                        .unwrap_or(Err(TransportError::Timeout(connect_timeout)))
                },
                |attempt, err| {
                    metrics::record_connect_failure();
                    tracing::warn!(attempt = %attempt, error = %err, "WebSocket connection attempt failed");
                },
            )
            .await;

        match opened {
            Ok(inner) => Ok(ManagedConnection::new(inner, self.settings.receive_timeout)),
            Err(err) => Err(TransportError::Exhausted {
                attempts: err.attempts(),
                last: Box::new(err.into_last()),
            }),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// An open connection scoped to one attempt.
///
/// Dropping it without calling [`close`](Self::close) logs a warning.
pub struct ManagedConnection {
    inner: Box<dyn Connection>,
    receive_timeout: Duration,
    closed: bool,
}

impl ManagedConnection {
    fn new(inner: Box<dyn Connection>, receive_timeout: Duration) -> Self {
        Self {
            inner,
            receive_timeout,
            closed: false,
        }
    }

    /// Send one text message.
    ///
    /// # Errors
    ///
    /// Returns the transport's send error.
    pub async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(text).await
    }

    /// Receive one text message within the receive timeout.
    ///
    /// `Ok(None)` means the peer closed the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if nothing arrives in time, or the
    /// transport's receive error.
    pub async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        tokio::time::timeout(self.receive_timeout, self.inner.receive())
            .await
            .unwrap_or(Err(TransportError::Timeout(self.receive_timeout)))
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error. The connection counts as released
    /// either way.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.inner.close().await
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!("Connection dropped without close");
        }
    }
}

// =============================================================================
// WebSocket Adapter
// =============================================================================

/// tokio-tungstenite [`Connector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(format!("header {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(url = %endpoint.url, "WebSocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {
                    // Ping/pong handled by tungstenite
                }
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::Error;

        match self.stream.close(None).await {
            Ok(()) | Err(Error::ConnectionClosed | Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Close(e.to_string())),
        }
    }
}
