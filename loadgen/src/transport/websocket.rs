//! WebSocket client primitive
//!
//! An explicit state machine (`Connecting -> Open -> Listening -> Closed | Errored`)
//! with a receive-with-timeout operation instead of event callbacks.

use crate::error::{ConfigError, TransportError};
use crate::scheduler::StopListener;
use futures_util::StreamExt;
use reqwest::Url;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, header};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

/// How the bearer token travels on the upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WsAuth {
    /// `Sec-WebSocket-Protocol: <token>`
    #[default]
    Subprotocol,
    /// `<name>: Bearer <token>`
    Header(String),
    /// `?<param>=<token>`
    Query(String),
}

impl FromStr for WsAuth {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            None if s.eq_ignore_ascii_case("subprotocol") => Ok(WsAuth::Subprotocol),
            None if s.eq_ignore_ascii_case("header") => {
                Ok(WsAuth::Header(header::AUTHORIZATION.as_str().to_string()))
            }
            Some((kind, name)) if kind.eq_ignore_ascii_case("header") && !name.is_empty() => {
                Ok(WsAuth::Header(name.to_string()))
            }
            Some((kind, param)) if kind.eq_ignore_ascii_case("query") && !param.is_empty() => {
                Ok(WsAuth::Query(param.to_string()))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "CHATLOAD_WS_AUTH",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Listening,
    Closed,
    Errored(String),
}

/// Result of one receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Text(String),
    Timeout,
    Closed,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsClient {
    ws: Socket,
    state: WsState,
}

impl WsClient {
    /// Upgrade to a WebSocket carrying `token` per `auth`
    pub async fn connect(
        url: &str,
        auth: &WsAuth,
        token: &str,
        timeout: Duration,
        stop: &mut StopListener,
    ) -> Result<Self, TransportError> {
        let url = match auth {
            WsAuth::Query(param) => with_query(url, param, token)?,
            _ => url.to_string(),
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        match auth {
            WsAuth::Subprotocol => {
                let value = HeaderValue::from_str(token)
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                request
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
            WsAuth::Header(name) => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                request.headers_mut().insert(name, value);
            }
            WsAuth::Query(_) => {}
        }

        debug!(url = %url, state = ?WsState::Connecting, "Opening websocket");
        tokio::select! {
            biased;
            _ = stop.aborted() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(timeout, connect_async(request)) => match result {
                Err(_) => Err(TransportError::Timeout(timeout)),
                Ok(Err(e)) => Err(e.into()),
                Ok(Ok((ws, _response))) => Ok(Self { ws, state: WsState::Open }),
            },
        }
    }

    pub fn state(&self) -> &WsState {
        &self.state
    }

    /// Wait up to `timeout` for the next text frame. Control frames are skipped.
    pub async fn recv(
        &mut self,
        timeout: Duration,
        stop: &mut StopListener,
    ) -> Result<WsEvent, TransportError> {
        if matches!(self.state, WsState::Closed | WsState::Errored(_)) {
            return Ok(WsEvent::Closed);
        }
        self.state = WsState::Listening;
        let deadline = Instant::now() + timeout;

        loop {
            let frame = tokio::select! {
                biased;
                _ = stop.aborted() => return Err(TransportError::Cancelled),
                frame = tokio::time::timeout_at(deadline, self.ws.next()) => frame,
            };

            match frame {
                Err(_) => return Ok(WsEvent::Timeout),
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    self.state = WsState::Closed;
                    return Ok(WsEvent::Closed);
                }
                Ok(Some(Err(e))) => {
                    self.state = WsState::Errored(e.to_string());
                    return Err(e.into());
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Ok(WsEvent::Text(text.as_str().to_owned()));
                }
                Ok(Some(Ok(Message::Binary(bytes)))) => {
                    return Ok(WsEvent::Text(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    /// Close the connection. Errors while closing are not interesting to the caller.
    pub async fn close(mut self) -> WsState {
        if matches!(self.state, WsState::Open | WsState::Listening) {
            let _ = self.ws.close(None).await;
            self.state = WsState::Closed;
        }
        self.state
    }
}

/// Append `param=token` to the URL, percent-encoded
fn with_query(url: &str, param: &str, token: &str) -> Result<String, TransportError> {
    let mut url = Url::parse(url).map_err(|e| TransportError::Connect(e.to_string()))?;
    url.query_pairs_mut().append_pair(param, token);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ws_auth() {
        assert_eq!("subprotocol".parse(), Ok(WsAuth::Subprotocol));
        assert_eq!(
            "header".parse(),
            Ok(WsAuth::Header("authorization".to_string()))
        );
        assert_eq!(
            "header:X-Token".parse(),
            Ok(WsAuth::Header("X-Token".to_string()))
        );
        assert_eq!("query:token".parse(), Ok(WsAuth::Query("token".to_string())));
        assert!("query:".parse::<WsAuth>().is_err());
        assert!("cookie".parse::<WsAuth>().is_err());
    }

    #[test]
    fn test_query_token_is_percent_encoded() {
        let url = with_query("ws://svc/events/connect?v=1", "token", "a b+c/=").unwrap();
        assert_eq!(url, "ws://svc/events/connect?v=1&token=a+b%2Bc%2F%3D");
    }

    #[tokio::test]
    async fn test_wss_reaches_tls_handshake() {
        // Plain TCP peer: the handshake fails, but TLS itself must be available
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let err = WsClient::connect(
            &format!("wss://127.0.0.1:{port}/events/connect"),
            &WsAuth::Subprotocol,
            "token",
            Duration::from_secs(2),
            &mut StopListener::detached(),
        )
        .await
        .err()
        .expect("handshake with a plain TCP peer must fail");
        assert!(
            !err.to_string().contains("TLS support not compiled in"),
            "unexpected error: {err:?}"
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let err = WsClient::connect(
            "ws://127.0.0.1:9/events/connect",
            &WsAuth::Subprotocol,
            "token",
            Duration::from_secs(2),
            &mut StopListener::detached(),
        )
        .await
        .err()
        .expect("connect must fail");
        assert!(err.is_unreachable(), "unexpected error: {err:?}");
    }
}
