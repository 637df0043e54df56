//! RFC 7395 WebSocket transport.
//!
//! Each WebSocket text frame holds exactly one top-level element, so no
//! boundary detection is needed. Frames are translated to and from stream
//! framing so the rest of the engine never sees `<open/>` or `<close/>`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::framing::{stream_to_ws, ws_to_stream};
use super::{tls, XmlTransport, TCP_CONNECT_TIMEOUT};
use crate::error::TransportError;

pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    secure: bool,
}

impl WebSocketTransport {
    pub async fn connect(url: &str, insecure_tls: bool) -> Result<Self, TransportError> {
        let secure = url.starts_with("wss://");
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));

        let connector = if secure {
            Some(tokio_tungstenite::Connector::Rustls(tls::client_config(insecure_tls)?))
        } else {
            None
        };

        let (ws, response) = tokio::time::timeout(
            TCP_CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector),
        )
        .await
        .map_err(|_| TransportError::Timeout(TCP_CONNECT_TIMEOUT.as_secs(), "WebSocket connect"))?
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        info!(url, status = %response.status(), secure, "Connected (WebSocket)");
        Ok(Self { ws, secure })
    }
}

#[async_trait]
impl XmlTransport for WebSocketTransport {
    async fn send(&mut self, xml: &str) -> Result<(), TransportError> {
        let translated = stream_to_ws(xml);
        self.ws
            .send(Message::Text(translated.into_owned()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn next_element(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(Some(ws_to_stream(&text).into_owned())),
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "WebSocket closed by server");
                    return Ok(None);
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
        Ok(None)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn can_start_tls(&self) -> bool {
        false
    }

    async fn start_tls(&mut self, _domain: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("STARTTLS is not available over WebSocket"))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Stream closed".into(),
            }))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
