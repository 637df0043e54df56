//! Client-side XMPP protocol engine.
//!
//! The crate negotiates an XMPP client stream (STARTTLS, SASL, resource
//! binding, stream management), keeps it alive across transport drops through
//! XEP-0198 resumption, and correlates outbound requests with their replies.
//!
//! ```no_run
//! # async fn demo() -> Result<(), fluux_xmpp::Error> {
//! use fluux_xmpp::{ConnectionConfig, Stanza, XmppConnection};
//!
//! let config = ConnectionConfig::new("juliet@capulet.lit", "r0m30").with_resource("balcony");
//! let (connection, mut events) = XmppConnection::connect(config).await?;
//! connection.send(&Stanza::presence())?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod extensions;
pub mod jid;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod sasl;
pub mod stanza;
pub mod stream_management;
pub mod transport;
pub mod xml;

pub use config::{ConnectionConfig, SecurityMode};
pub use connection::{ConnectionEvent, SessionSnapshot, XmppConnection};
pub use correlator::{Correlator, IqReplyFilter, PendingRequest, StanzaFilter};
pub use error::{DecodeError, Error, NegotiationError, RequestError, SaslError, TransportError};
pub use jid::Jid;
pub use negotiation::StateId;
pub use registry::{CodecRegistry, ExtensionDecoder, ExtensionPayload};
pub use stanza::{Payload, Stanza, StanzaKind};
