use async_trait::async_trait;
use cv_core::{decode_handshake, encode, DecodeError, EncodeError, OutboundRequest};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("unauthorized: the server rejected the token")]
    Unauthorized,
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

impl ConnectError {
    /// Only transient network failures are worth another dial.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Unreachable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection dropped: {0}")]
    Dropped(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Text-frame transport underneath a [`Connection`]. Control and binary
/// frames never surface here.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;
    /// `None` once the peer has closed the stream.
    async fn recv_text(&mut self) -> Option<Result<String, ConnectionError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    type Transport: FrameTransport + 'static;

    async fn dial(&self, endpoint: &Url, token: &str) -> Result<Self::Transport, ConnectError>;
}

/// An authenticated, acknowledged session socket.
pub struct Connection<T> {
    transport: T,
    session_id: String,
}

impl<T: FrameTransport> Connection<T> {
    pub async fn connect<D>(
        dialer: &D,
        endpoint: &Url,
        token: &str,
        workspace: &str,
    ) -> Result<Self, ConnectError>
    where
        D: Dialer<Transport = T>,
    {
        let mut transport = dialer.dial(endpoint, token).await?;
        let hello = encode(&OutboundRequest::Connect {
            workspace: workspace.to_string(),
        })
        .map_err(|err| ConnectError::Rejected(err.to_string()))?;
        if let Err(err) = transport.send_text(hello).await {
            transport.close().await;
            return Err(ConnectError::Unreachable(err.to_string()));
        }

        let ack = match tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.recv_text()).await {
            Ok(Some(Ok(text))) => text,
            Ok(Some(Err(err))) => {
                transport.close().await;
                return Err(ConnectError::Unreachable(err.to_string()));
            }
            Ok(None) => {
                transport.close().await;
                return Err(ConnectError::Unreachable(
                    "closed during handshake".to_string(),
                ));
            }
            Err(_) => {
                transport.close().await;
                return Err(ConnectError::Unreachable(
                    "handshake timed out".to_string(),
                ));
            }
        };
        match decode_handshake(&ack) {
            Ok(session_id) => {
                info!("session_connected: {session_id}");
                Ok(Self {
                    transport,
                    session_id,
                })
            }
            Err(err) => {
                transport.close().await;
                Err(match err {
                    DecodeError::Refused(message) => ConnectError::Rejected(message),
                    other => ConnectError::Rejected(other.to_string()),
                })
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&mut self, request: &OutboundRequest) -> Result<(), ConnectionError> {
        let text = encode(request)?;
        debug!("frame_out: {}", request.kind());
        self.transport.send_text(text).await
    }

    pub async fn next_frame(&mut self) -> Option<Result<String, ConnectionError>> {
        self.transport.recv_text().await
    }

    pub async fn close(mut self) {
        self.transport.close().await;
        info!("session_closed: {}", self.session_id);
    }
}

/// Dials the platform WebSocket with the token in the upgrade request.
#[derive(Debug, Clone)]
pub struct WsDialer {
    pub connect_timeout: Duration,
}

impl Default for WsDialer {
    fn default() -> Self {
        Self {
            connect_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Transport = WsTransport;

    async fn dial(&self, endpoint: &Url, token: &str) -> Result<WsTransport, ConnectError> {
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ConnectError::Unauthorized)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match tokio::time::timeout(self.connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => Ok(WsTransport { stream }),
            Ok(Err(err)) => Err(classify_dial_error(err)),
            Err(_) => Err(ConnectError::Unreachable("connect timed out".to_string())),
        }
    }
}

fn classify_dial_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            ConnectError::Unauthorized
        }
        tungstenite::Error::Http(response) => {
            warn!("ws_upgrade_refused: {}", response.status());
            ConnectError::Unreachable(format!("upgrade refused with {}", response.status()))
        }
        other => ConnectError::Unreachable(other.to_string()),
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| ConnectionError::Dropped(err.to_string()))
    }

    async fn recv_text(&mut self) -> Option<Result<String, ConnectionError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!("ws_close: {frame:?}");
                    return None;
                }
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(err) => return Some(Err(ConnectionError::Dropped(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!("ws_close_error: {err}");
        }
    }
}
