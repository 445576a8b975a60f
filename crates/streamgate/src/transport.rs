//! One physical WebSocket connection.
//!
//! [`TransportSocket`] wraps a single socket and reports what happens to it as
//! a sequence of [`LifecycleEvent`]s. It never reconnects; that is the
//! connection task's job.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{StreamError, StreamResult};

/// Close code for a normal, requested closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code used when the socket died without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code reported when the peer sent a close frame without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// How long `close` waits for the peer to finish the close handshake.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a socket ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
    /// Whether this side requested the closure.
    pub was_clean: bool,
}

impl CloseEvent {
    /// Closure requested by the client.
    #[must_use]
    pub fn clean(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// Socket lost without a close handshake.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Clean closures never trigger reconnection.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.code == CLOSE_NORMAL && self.was_clean
    }
}

/// What happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Socket is open. Always the first event.
    Opened,
    /// A text frame arrived.
    MessageReceived(String),
    /// Control-frame traffic (ping/pong) arrived.
    Heartbeat,
    /// A socket error occurred. Always followed by `Closed`.
    Errored(String),
    /// Socket is gone. No further events follow.
    Closed(CloseEvent),
}

/// Credentials available for opening a socket.
///
/// A session cookie is the ambient credential and is preferred; the token is
/// only appended to the URL when no cookie is present.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    session_cookie: Option<String>,
    token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("session_cookie", &self.session_cookie.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// No credentials.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Credentials carrying only a token.
    #[must_use]
    pub fn token(token: impl Into<String>) -> Self {
        Self::default().with_token(token)
    }

    /// Credentials carrying only a session cookie (`name=value`).
    #[must_use]
    pub fn session_cookie(cookie: impl Into<String>) -> Self {
        Self::default().with_session_cookie(cookie)
    }

    /// Set the session cookie sent with the upgrade request.
    #[must_use]
    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into()).filter(|c: &String| !c.is_empty());
        self
    }

    /// Set the token used for the query-parameter fallback.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t: &String| !t.is_empty());
        self
    }

    /// Whether neither credential is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.session_cookie.is_none() && self.token.is_none()
    }
}

/// A fully resolved socket address for one endpoint path.
#[derive(Clone)]
pub struct Endpoint {
    path: String,
    url: Url,
    session_cookie: Option<String>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .field("url", &self.redacted_url())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted_url())
    }
}

impl Endpoint {
    /// Build `ws(s)://<host>/ws/<path>` from a base URL.
    ///
    /// `http` maps to `ws` and `https` to `wss`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::MissingCredential`] when no credential is
    /// available, or [`StreamError::InvalidEndpoint`] for a bad base URL or
    /// empty path.
    pub fn resolve(base: &Url, path: &str, credentials: &Credentials) -> StreamResult<Self> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(StreamError::InvalidEndpoint("endpoint path is empty".to_string()));
        }
        if credentials.is_empty() {
            return Err(StreamError::MissingCredential(format!("/{path}")));
        }

        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(StreamError::InvalidEndpoint(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };

        let mut url = base.clone();
        url.set_scheme(scheme)
            .map_err(|()| StreamError::InvalidEndpoint(format!("cannot use scheme {scheme}")))?;
        url.set_path(&format!("/ws/{path}"));
        url.set_query(None);
        url.set_fragment(None);

        if credentials.session_cookie.is_none() {
            if let Some(token) = &credentials.token {
                url.query_pairs_mut().append_pair("token", token);
            }
        }

        Ok(Self {
            path: format!("/{path}"),
            url,
            session_cookie: credentials.session_cookie.clone(),
        })
    }

    /// Logical endpoint path, with a leading slash.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full socket URL, including any token.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the token was placed in the query string.
    #[must_use]
    pub fn uses_query_token(&self) -> bool {
        self.url.query_pairs().any(|(k, _)| k == "token")
    }

    fn redacted_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.to_string()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns one open WebSocket.
pub struct TransportSocket {
    ws: WsStream,
    open: bool,
    announced: bool,
    pending_close: Option<CloseEvent>,
}

impl std::fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSocket")
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl TransportSocket {
    /// Open a socket to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Transport`] if the connection or handshake fails
    /// or does not complete within `connect_timeout`.
    pub async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> StreamResult<Self> {
        let mut request = endpoint.url.as_str().into_client_request()?;
        if let Some(cookie) = &endpoint.session_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| StreamError::InvalidEndpoint(format!("invalid cookie: {e}")))?;
            request.headers_mut().insert(header::COOKIE, value);
        }

        debug!(%endpoint, "opening socket");
        let (ws, _response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| StreamError::Transport("connect timed out".to_string()))??;

        Ok(Self {
            ws,
            open: true,
            announced: false,
            pending_close: None,
        })
    }

    /// Whether the socket is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotConnected`] if the socket is not open, or
    /// [`StreamError::Transport`] if the write fails.
    pub async fn send(&mut self, text: String) -> StreamResult<()> {
        if !self.open {
            return Err(StreamError::NotConnected);
        }
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a WebSocket ping.
    ///
    /// # Errors
    ///
    /// Same as [`TransportSocket::send`].
    pub async fn ping(&mut self) -> StreamResult<()> {
        if !self.open {
            return Err(StreamError::NotConnected);
        }
        self.ws.send(Message::Ping(Default::default())).await?;
        Ok(())
    }

    /// Close the socket. Always succeeds and always reports a clean closure.
    pub async fn close(&mut self, code: u16, reason: &str) -> CloseEvent {
        if self.open {
            self.open = false;
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            if let Err(e) = self.ws.close(Some(frame)).await {
                debug!(error = %e, "close frame not delivered");
            } else {
                // Let the peer answer so the handshake completes.
                let drain = async { while let Some(Ok(_)) = self.ws.next().await {} };
                if timeout(CLOSE_HANDSHAKE_TIMEOUT, drain).await.is_err() {
                    trace!("peer did not finish close handshake");
                }
            }
        }
        CloseEvent {
            code,
            reason: reason.to_string(),
            was_clean: true,
        }
    }

    /// Wait for the next lifecycle event.
    pub async fn next_event(&mut self) -> LifecycleEvent {
        if !self.announced {
            self.announced = true;
            return LifecycleEvent::Opened;
        }
        if let Some(close) = self.pending_close.take() {
            return LifecycleEvent::Closed(close);
        }
        if !self.open {
            return LifecycleEvent::Closed(CloseEvent::abnormal("socket not open"));
        }

        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return LifecycleEvent::MessageReceived(text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return LifecycleEvent::MessageReceived(text),
                    Err(_) => warn!(len = data.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    return LifecycleEvent::Heartbeat;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    self.open = false;
                    let close = frame.map_or_else(
                        || CloseEvent {
                            code: CLOSE_NO_STATUS,
                            reason: String::new(),
                            was_clean: false,
                        },
                        |frame| CloseEvent {
                            code: u16::from(frame.code),
                            reason: frame.reason.as_str().to_owned(),
                            was_clean: false,
                        },
                    );
                    debug!(code = close.code, reason = %close.reason, "peer closed socket");
                    return LifecycleEvent::Closed(close);
                }
                Some(Err(e)) => {
                    self.open = false;
                    self.pending_close = Some(CloseEvent::abnormal(e.to_string()));
                    return LifecycleEvent::Errored(e.to_string());
                }
                None => {
                    self.open = false;
                    return LifecycleEvent::Closed(CloseEvent::abnormal("connection closed"));
                }
            }
        }
    }
}
