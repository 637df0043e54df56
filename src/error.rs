//! Error types for the protocol engine.
//!
//! Each concern has its own enum so callers can match on exactly the failures a
//! given operation can produce. [`Error`] wraps all of them for the public
//! connection API.

use thiserror::Error;

use crate::negotiation::StateId;

fn text_suffix(text: &Option<String>) -> String {
    text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default()
}

/// Malformed input on the inbound path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("unexpected end of element while decoding <{0}>")]
    UnexpectedEnd(String),

    #[error("missing attribute '{attribute}' on <{element}>")]
    MissingAttribute { element: String, attribute: String },

    #[error("invalid value for '{attribute}' on <{element}>: {value}")]
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
    },

    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("{0}")]
    Codec(String),
}

/// Failures of the authentication mechanism layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaslError {
    #[error("no common SASL mechanism (server offered: {offered:?})")]
    NoCommonMechanism { offered: Vec<String> },

    #[error("malformed server message: {0}")]
    MalformedChallenge(String),

    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,

    #[error("server signature verification failed")]
    ServerVerificationFailed,

    #[error("server reported error: {0}")]
    ServerError(String),

    #[error("authentication failed: {condition}{}", text_suffix(.text))]
    Failure {
        condition: String,
        text: Option<String>,
    },

    #[error("unexpected {0} for the current exchange step")]
    UnexpectedStep(&'static str),
}

/// Failures of the byte-stream transport below the XML stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("timed out after {0}s: {1}")]
    Timeout(u64, &'static str),

    #[error("XML framing error: {0}")]
    Framing(String),

    #[error("inbound stanza buffer exceeded {0} bytes")]
    BufferOverflow(usize),

    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Unsupported(&'static str),
}

/// Terminal failure of the negotiation state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no transition available from state {state:?}")]
    NoTransition { state: StateId },

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("server refused STARTTLS")]
    TlsRefused,

    #[error("TLS is required but the server does not offer STARTTLS")]
    TlsUnavailable,

    #[error("authentication failed: {0}")]
    Authentication(#[from] SaslError),

    #[error("resource binding failed: {0}")]
    BindFailed(String),

    #[error("stream error: {condition}{}", text_suffix(.text))]
    StreamError {
        condition: String,
        text: Option<String>,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("connection shut down")]
    Shutdown,
}

/// Outcome of a request awaiting its reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("no reply received within {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed before a reply arrived: {0}")]
    ConnectionClosed(String),

    #[error("not connected")]
    NotConnected,

    #[error("stanza error: {condition}")]
    StanzaError { condition: String },
}

/// Top-level error returned by the connection API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sasl(#[from] SaslError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("invalid JID '{0}'")]
    InvalidJid(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
