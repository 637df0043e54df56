//! XML primitives: the pull cursor the inbound path reads with, and a small
//! owned element tree for protocol elements and payloads without a codec.

mod cursor;
mod element;

pub use cursor::{EventKind, XmlCursor};
pub use element::{Element, Node};

/// Namespaces the protocol engine itself speaks.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const SM: &str = "urn:xmpp:sm:3";
    pub const PING: &str = "urn:xmpp:ping";
    pub const DELAY: &str = "urn:xmpp:delay";
}
