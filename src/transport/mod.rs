//! Byte-stream transports carrying the XML stream.
//!
//! The connection driver only sees [`XmlTransport`]: a sequence of complete
//! top-level elements in, serialised XML out. [`Connector`] produces a fresh
//! transport for every connect and reconnect.

pub mod dns;
pub mod framing;
pub mod tls;
mod websocket;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use dns::{Endpoint, Security, ServerTarget};
use framing::ElementSplitter;
pub use websocket::WebSocketTransport;

/// TCP connection timeout for outbound XMPP server connections.
///
/// Applied to both STARTTLS (port 5222) and direct TLS (port 5223) connects.
/// Without this, the OS default applies, which on some platforms is 30-120
/// seconds for unreachable hosts.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum size of the inbound element buffer.
///
/// If the buffer exceeds this limit the connection is closed. This prevents
/// unbounded memory growth when the server sends data that never forms a
/// complete element (malformed XML, malicious input, or protocol errors).
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

const READ_CHUNK_SIZE: usize = 8192;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An XML stream over some byte transport.
#[async_trait]
pub trait XmlTransport: Send {
    /// Write serialised XML and flush it.
    async fn send(&mut self, xml: &str) -> Result<(), TransportError>;

    /// Next complete top-level element, the stream header, or `</stream:stream>`.
    ///
    /// `Ok(None)` means the peer closed the connection. Cancel-safe: dropping
    /// the future loses no data.
    async fn next_element(&mut self) -> Result<Option<String>, TransportError>;

    fn is_secure(&self) -> bool;

    /// Whether a STARTTLS upgrade is possible on this transport.
    fn can_start_tls(&self) -> bool;

    /// Upgrade to TLS after the server's `<proceed/>`.
    async fn start_tls(&mut self, domain: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `domain`, or to `server` when given (server-input syntax, see
    /// [`ServerTarget::parse`]).
    async fn connect(
        &self,
        domain: &str,
        server: Option<&str>,
    ) -> Result<Box<dyn XmlTransport>, TransportError>;
}

/// XML stream over a TCP (or any other) byte stream with optional STARTTLS.
pub struct StreamTransport {
    stream: Option<BoxedStream>,
    buffer: Vec<u8>,
    splitter: ElementSplitter,
    read_buf: Vec<u8>,
    secure: bool,
    insecure_tls: bool,
}

impl StreamTransport {
    pub fn new(stream: BoxedStream, secure: bool, insecure_tls: bool) -> Self {
        Self {
            stream: Some(stream),
            buffer: Vec::new(),
            splitter: ElementSplitter::default(),
            read_buf: vec![0u8; READ_CHUNK_SIZE],
            secure,
            insecure_tls,
        }
    }

    fn stream(&mut self) -> Result<&mut BoxedStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl XmlTransport for StreamTransport {
    async fn send(&mut self, xml: &str) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(xml.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn next_element(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some((element, used)) = self.splitter.next(&self.buffer)? {
                self.buffer.drain(..used);
                return Ok(Some(element));
            }
            // Whitespace keepalives between elements carry nothing.
            if !self.buffer.is_empty() && self.buffer.iter().all(u8::is_ascii_whitespace) {
                self.buffer.clear();
                self.splitter.reset();
            }
            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                error!(
                    buffer_bytes = self.buffer.len(),
                    limit = MAX_STANZA_BUFFER_SIZE,
                    "Stanza buffer exceeded size limit"
                );
                return Err(TransportError::BufferOverflow(MAX_STANZA_BUFFER_SIZE));
            }

            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            let n = stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&self.read_buf[..n]);
        }
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn can_start_tls(&self) -> bool {
        !self.secure
    }

    async fn start_tls(&mut self, domain: &str) -> Result<(), TransportError> {
        let stream = self.stream.take().ok_or(TransportError::Closed)?;
        // Anything buffered after <proceed/> would be plaintext injected ahead of the handshake.
        if !self.buffer.is_empty() {
            warn!(bytes = self.buffer.len(), "Discarding plaintext received after STARTTLS proceed");
            self.buffer.clear();
        }
        self.splitter.reset();
        let tls_stream = tls::upgrade_to_tls(stream, domain, self.insecure_tls).await?;
        self.stream = Some(tls_stream);
        self.secure = true;
        info!(domain, "STARTTLS upgrade complete");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Connects over TCP (SRV-resolved or explicit) or WebSocket.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    insecure_tls: bool,
}

impl TcpConnector {
    pub fn new(insecure_tls: bool) -> Self {
        Self { insecure_tls }
    }

    async fn connect_endpoint(&self, endpoint: &Endpoint) -> Result<StreamTransport, TransportError> {
        let started = Instant::now();
        let tcp_stream = tokio::time::timeout(
            TCP_CONNECT_TIMEOUT,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            error!(
                host = %endpoint.host, port = endpoint.port, security = ?endpoint.security,
                timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
                "TCP connect timed out"
            );
            TransportError::Timeout(TCP_CONNECT_TIMEOUT.as_secs(), "TCP connect")
        })?
        .map_err(|e| {
            error!(
                host = %endpoint.host, port = endpoint.port, security = ?endpoint.security,
                error = %e, error_kind = ?e.kind(),
                "TCP connect failed"
            );
            TransportError::Io(e)
        })?;
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!(host = %endpoint.host, error = %e, "Could not disable Nagle's algorithm");
        }

        match endpoint.security {
            Security::StartTls => {
                info!(host = %endpoint.host, port = endpoint.port,
                    connect_ms = started.elapsed().as_millis() as u64, "Connected (TCP)");
                Ok(StreamTransport::new(Box::new(tcp_stream), false, self.insecure_tls))
            }
            Security::DirectTls => {
                // SNI is the XMPP domain, not the SRV target host
                let tls_stream =
                    tls::upgrade_to_tls(Box::new(tcp_stream), endpoint.server_name(), self.insecure_tls)
                        .await?;
                info!(host = %endpoint.host, port = endpoint.port, tls_name = endpoint.server_name(),
                    connect_ms = started.elapsed().as_millis() as u64, "Connected (direct TLS)");
                Ok(StreamTransport::new(tls_stream, true, self.insecure_tls))
            }
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        domain: &str,
        server: Option<&str>,
    ) -> Result<Box<dyn XmlTransport>, TransportError> {
        let target = match server {
            Some(server) => ServerTarget::parse(server),
            None => ServerTarget::Srv(domain.to_string()),
        };

        let endpoints = match target {
            ServerTarget::WebSocket(url) => {
                let transport = WebSocketTransport::connect(&url, self.insecure_tls).await?;
                return Ok(Box::new(transport));
            }
            ServerTarget::Endpoint(endpoint) => {
                debug!(host = %endpoint.host, port = endpoint.port, security = ?endpoint.security,
                    "Using explicit endpoint");
                vec![endpoint]
            }
            ServerTarget::Srv(domain) => dns::resolve(&domain).await,
        };

        let mut last_error = None;
        for endpoint in &endpoints {
            match self.connect_endpoint(endpoint).await {
                Ok(transport) => return Ok(Box::new(transport)),
                Err(e) => {
                    warn!(host = %endpoint.host, port = endpoint.port, error = %e,
                        "Endpoint failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::Dns(format!("no endpoints for {}", domain))))
    }
}
