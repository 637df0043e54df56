//! Stanzas (`message`, `presence`, `iq`) and their payloads.
//!
//! Every child of a stanza becomes one [`Payload`]:
//! - a registered decoder succeeded → [`Payload::Known`]
//! - no decoder is registered → [`Payload::Element`] (preserved as a tree)
//! - the decoder failed → [`Payload::Unparsed`], carrying the child's raw XML
//!   exactly as received. The cursor is always advanced past the failed child,
//!   so one bad extension never corrupts the rest of the stanza.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::DecodeError;
use crate::registry::{CodecRegistry, DecodeContext, ExtensionPayload};
use crate::xml::{ns, Element, EventKind, XmlCursor};

static NEXT_STANZA_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a stanza id unique within this process.
pub fn next_stanza_id() -> String {
    format!("fx{}", NEXT_STANZA_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

/// A child element whose decoder failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparsedPayload {
    pub name: String,
    pub namespace: String,
    /// The child's XML, byte for byte as it appeared on the wire.
    pub raw_xml: String,
    pub error: DecodeError,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Known(Arc<dyn ExtensionPayload>),
    Element(Element),
    Unparsed(UnparsedPayload),
}

#[derive(Debug, Clone)]
pub struct Stanza {
    kind: StanzaKind,
    attributes: Vec<(String, String)>,
    payloads: Vec<Payload>,
}

impl Stanza {
    pub fn new(kind: StanzaKind) -> Self {
        Self {
            kind,
            attributes: Vec::new(),
            payloads: Vec::new(),
        }
    }

    /// A chat message with a body.
    pub fn message(to: &str, body: &str) -> Self {
        Stanza::new(StanzaKind::Message)
            .with_attr("to", to)
            .with_attr("type", "chat")
            .with_attr("id", next_stanza_id())
            .with_element(Element::new("body", ns::CLIENT).with_text(body))
    }

    pub fn presence() -> Self {
        Stanza::new(StanzaKind::Presence)
    }

    /// An IQ of the given type (`get`/`set`) with a fresh id.
    pub fn iq(iq_type: &str) -> Self {
        Stanza::new(StanzaKind::Iq)
            .with_attr("type", iq_type)
            .with_attr("id", next_stanza_id())
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.payloads.push(Payload::Element(element));
        self
    }

    pub fn with_payload(mut self, payload: Arc<dyn ExtensionPayload>) -> Self {
        self.payloads.push(Payload::Known(payload));
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.attr("to")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// First decoded payload of type `T`.
    pub fn find<T: ExtensionPayload>(&self) -> Option<&T> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Known(k) => k.as_any().downcast_ref::<T>(),
            _ => None,
        })
    }

    /// First undecoded child element with this name and namespace.
    pub fn get_element(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Element(e) if e.is(name, namespace) => Some(e),
            _ => None,
        })
    }

    pub fn unparsed(&self) -> impl Iterator<Item = &UnparsedPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Unparsed(u) => Some(u),
            _ => None,
        })
    }

    pub fn body(&self) -> Option<String> {
        self.get_element("body", ns::CLIENT).map(Element::text)
    }

    /// An IQ of type `get` or `set`, which the recipient must answer.
    pub fn is_iq_request(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.stanza_type(), Some("get") | Some("set"))
    }

    /// An IQ of type `result` or `error`.
    pub fn is_iq_response(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.stanza_type(), Some("result") | Some("error"))
    }

    /// The defined condition of a `type='error'` stanza.
    pub fn error_condition(&self) -> Option<String> {
        if self.stanza_type() != Some("error") {
            return None;
        }
        let error = self.get_element("error", ns::CLIENT)?;
        error
            .children()
            .find(|c| c.namespace() == ns::STANZAS && c.name() != "text")
            .map(|c| c.name().to_string())
    }

    /// Empty `result` reply to an IQ request.
    pub fn make_result(&self) -> Stanza {
        let mut reply = Stanza::new(StanzaKind::Iq).with_attr("type", "result");
        self.copy_reply_addressing(&mut reply);
        reply
    }

    /// Error reply carrying a defined stanza error condition.
    pub fn make_error(&self, error_type: &str, condition: &str) -> Stanza {
        let mut reply = Stanza::new(self.kind).with_attr("type", "error");
        self.copy_reply_addressing(&mut reply);
        reply.with_element(
            Element::new("error", ns::CLIENT)
                .with_attr("type", error_type)
                .with_child(Element::new(condition, ns::STANZAS)),
        )
    }

    fn copy_reply_addressing(&self, reply: &mut Stanza) {
        if let Some(id) = self.id() {
            reply.set_attr("id", id);
        }
        if let Some(from) = self.from() {
            reply.set_attr("to", from);
        }
    }

    /// Decode a stanza from a cursor positioned on its start tag.
    pub fn from_cursor(
        cursor: &mut XmlCursor<'_>,
        registry: &CodecRegistry,
    ) -> Result<Stanza, DecodeError> {
        let kind = StanzaKind::from_name(cursor.name())
            .ok_or_else(|| DecodeError::Xml(format!("<{}> is not a stanza", cursor.name())))?;
        let enclosing_namespace = cursor.namespace().to_string();
        let depth = cursor.depth();
        let mut stanza = Stanza::new(kind);
        stanza.attributes = cursor.attributes().to_vec();

        let context = DecodeContext {
            enclosing_namespace: &enclosing_namespace,
            stanza_name: kind.as_str(),
        };

        loop {
            match cursor.next()? {
                Some(EventKind::Start) => {
                    let payload = decode_child(cursor, registry, &context)?;
                    stanza.payloads.push(payload);
                }
                Some(EventKind::End) if cursor.depth() == depth => return Ok(stanza),
                // Whitespace between children carries no meaning.
                Some(_) => continue,
                None => return Err(DecodeError::UnexpectedEnd(kind.as_str().to_string())),
            }
        }
    }

    /// Parse a complete stanza from a string.
    pub fn parse(xml: &str, registry: &CodecRegistry) -> Result<Stanza, DecodeError> {
        let mut cursor = XmlCursor::new(xml);
        loop {
            match cursor.next()? {
                Some(EventKind::Start) => return Stanza::from_cursor(&mut cursor, registry),
                Some(EventKind::Text) => continue,
                _ => return Err(DecodeError::Xml("no stanza element".to_string())),
            }
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push('<');
        out.push_str(self.kind.as_str());
        out.push_str(" xmlns='jabber:client'");
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&quick_xml::escape::escape(v));
            out.push('\'');
        }
        if self.payloads.is_empty() {
            out.push_str("/>");
            return out;
        }
        out.push('>');
        for payload in &self.payloads {
            match payload {
                Payload::Known(p) => p.to_element().write_xml(&mut out, Some(ns::CLIENT)),
                Payload::Element(e) => e.write_xml(&mut out, Some(ns::CLIENT)),
                Payload::Unparsed(u) => out.push_str(&u.raw_xml),
            }
        }
        out.push_str("</");
        out.push_str(self.kind.as_str());
        out.push('>');
        out
    }
}

fn decode_child(
    cursor: &mut XmlCursor<'_>,
    registry: &CodecRegistry,
    context: &DecodeContext<'_>,
) -> Result<Payload, DecodeError> {
    let name = cursor.name().to_string();
    let namespace = cursor.namespace().to_string();

    let Some(decoder) = registry.lookup(&name, &namespace) else {
        return Ok(Payload::Element(Element::from_cursor(cursor)?));
    };

    let start = cursor.event_start();
    let depth = cursor.depth();
    match decoder.decode(cursor, context) {
        Ok(payload) => {
            cursor.skip_to_end(depth, &name)?;
            Ok(Payload::Known(payload))
        }
        Err(error) => {
            // Consume the rest of the child so the stanza stays in sync.
            cursor.skip_to_end(depth, &name)?;
            let raw_xml = cursor.input()[start..cursor.position()].to_string();
            debug!(element = %name, namespace = %namespace, error = %error, "Extension decode failed, keeping raw XML");
            Ok(Payload::Unparsed(UnparsedPayload {
                name,
                namespace,
                raw_xml,
                error,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{Delay, Ping};

    #[test]
    fn test_parse_message_with_known_and_unknown_children() {
        let registry = CodecRegistry::with_defaults();
        let xml = "<message xmlns='jabber:client' from='a@b/c' id='m1' type='chat'>\
                   <body>Hello</body>\
                   <delay xmlns='urn:xmpp:delay' stamp='2002-09-10T23:08:25Z'/>\
                   <active xmlns='http://jabber.org/protocol/chatstates'/>\
                   </message>";
        let stanza = Stanza::parse(xml, &registry).unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Message);
        assert_eq!(stanza.id(), Some("m1"));
        assert_eq!(stanza.body().as_deref(), Some("Hello"));
        assert_eq!(stanza.find::<Delay>().unwrap().stamp, "2002-09-10T23:08:25Z");
        assert!(stanza
            .get_element("active", "http://jabber.org/protocol/chatstates")
            .is_some());
    }

    #[test]
    fn test_failed_decoder_preserves_raw_xml_and_rest_of_stanza() {
        let registry = CodecRegistry::with_defaults();
        let bad = "<delay xmlns='urn:xmpp:delay' stamp='nope'><x a=\"1\">t</x></delay>";
        let xml = format!(
            "<message xmlns='jabber:client' id='m2'>{}<body>after</body></message>",
            bad
        );
        let stanza = Stanza::parse(&xml, &registry).unwrap();

        let unparsed: Vec<_> = stanza.unparsed().collect();
        assert_eq!(unparsed.len(), 1);
        assert_eq!(unparsed[0].raw_xml, bad);
        assert_eq!(unparsed[0].namespace, ns::DELAY);
        assert!(matches!(unparsed[0].error, DecodeError::InvalidAttribute { .. }));
        assert_eq!(stanza.body().as_deref(), Some("after"));
    }

    #[test]
    fn test_unparsed_payload_reserialises_verbatim() {
        let registry = CodecRegistry::with_defaults();
        let bad = "<delay xmlns='urn:xmpp:delay'   stamp=\"x\" ><![CDATA[keep]]></delay>";
        let xml = format!("<message xmlns='jabber:client'>{}</message>", bad);
        let stanza = Stanza::parse(&xml, &registry).unwrap();
        assert!(stanza.to_xml().contains(bad));
    }

    #[test]
    fn test_stanza_round_trip() {
        let registry = CodecRegistry::with_defaults();
        let delay = Delay {
            stamp: "2024-01-01T00:00:00Z".to_string(),
            from: None,
            reason: None,
        };
        let original = Stanza::iq("get")
            .with_attr("to", "capulet.lit")
            .with_payload(Arc::new(Ping))
            .with_payload(Arc::new(delay.clone()));

        let decoded = Stanza::parse(&original.to_xml(), &registry).unwrap();
        assert_eq!(decoded.kind(), original.kind());
        assert_eq!(decoded.id(), original.id());
        assert_eq!(decoded.to(), Some("capulet.lit"));
        assert_eq!(decoded.find::<Ping>(), Some(&Ping));
        assert_eq!(decoded.find::<Delay>(), Some(&delay));
        assert_eq!(decoded.to_xml(), original.to_xml());
    }

    #[test]
    fn test_make_error_reply() {
        let registry = CodecRegistry::new();
        let request = Stanza::parse(
            "<iq xmlns='jabber:client' type='get' id='q1' from='capulet.lit'><query xmlns='urn:unknown'/></iq>",
            &registry,
        )
        .unwrap();
        assert!(request.is_iq_request());

        let reply = request.make_error("cancel", "service-unavailable");
        assert_eq!(reply.id(), Some("q1"));
        assert_eq!(reply.to(), Some("capulet.lit"));
        let reparsed = Stanza::parse(&reply.to_xml(), &registry).unwrap();
        assert!(reparsed.is_iq_response());
        assert_eq!(reparsed.error_condition().as_deref(), Some("service-unavailable"));
    }

    #[test]
    fn test_truncated_stanza_is_error() {
        let registry = CodecRegistry::new();
        assert!(Stanza::parse("<message xmlns='jabber:client'><body>", &registry).is_err());
    }
}
