//! Top-level protocol elements: classification of everything the server sends
//! outside of (and besides) stanzas, and builders for what the client sends.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use crate::error::DecodeError;
use crate::registry::CodecRegistry;
use crate::stanza::Stanza;
use crate::transport::framing::qualify_top_level;
use crate::xml::{ns, Element, EventKind, XmlCursor};

pub const STREAM_END: &str = "</stream:stream>";

/// Stream features advertised by the server after each stream (re)start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamFeatures {
    /// `Some(required)` when STARTTLS is offered.
    pub starttls: Option<bool>,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    pub stream_management: bool,
    /// Every advertised feature as `(name, namespace)`, in order.
    pub advertised: Vec<(String, String)>,
}

impl StreamFeatures {
    pub fn from_element(features: &Element) -> Self {
        let mut out = StreamFeatures::default();
        for child in features.children() {
            out.advertised
                .push((child.name().to_string(), child.namespace().to_string()));
            match (child.name(), child.namespace()) {
                ("starttls", ns::TLS) => {
                    out.starttls = Some(child.has_child("required", ns::TLS));
                }
                ("mechanisms", ns::SASL) => {
                    out.mechanisms = child
                        .children()
                        .filter(|m| m.is("mechanism", ns::SASL))
                        .map(|m| m.text().trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect();
                }
                ("bind", ns::BIND) => out.bind = true,
                ("sm", ns::SM) => out.stream_management = true,
                _ => {}
            }
        }
        out
    }
}

/// Outcome of an `<enabled/>` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmEnabled {
    pub id: Option<String>,
    pub resume: bool,
    pub max: Option<u32>,
    pub location: Option<String>,
}

/// One classified top-level element.
#[derive(Debug, Clone)]
pub enum Inbound {
    StreamHeader { id: Option<String>, from: Option<String> },
    StreamEnd,
    Features(StreamFeatures),
    TlsProceed,
    TlsFailure,
    SaslChallenge(Vec<u8>),
    SaslSuccess(Vec<u8>),
    SaslFailure { condition: String, text: Option<String> },
    SmEnabled(SmEnabled),
    SmFailed { h: Option<u32>, condition: Option<String> },
    SmResumed { previd: String, h: u32 },
    SmAck(u32),
    SmRequest,
    StreamError { condition: String, text: Option<String> },
    Stanza(Stanza),
    Unknown(Element),
}

impl Inbound {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Inbound::StreamHeader { .. } => "stream-header",
            Inbound::StreamEnd => "stream-end",
            Inbound::Features(_) => "features",
            Inbound::TlsProceed => "tls-proceed",
            Inbound::TlsFailure => "tls-failure",
            Inbound::SaslChallenge(_) => "sasl-challenge",
            Inbound::SaslSuccess(_) => "sasl-success",
            Inbound::SaslFailure { .. } => "sasl-failure",
            Inbound::SmEnabled(_) => "sm-enabled",
            Inbound::SmFailed { .. } => "sm-failed",
            Inbound::SmResumed { .. } => "sm-resumed",
            Inbound::SmAck(_) => "sm-ack",
            Inbound::SmRequest => "sm-request",
            Inbound::StreamError { .. } => "stream-error",
            Inbound::Stanza(_) => "stanza",
            Inbound::Unknown(_) => "unknown",
        }
    }
}

/// Classify one top-level element as produced by the transport.
pub fn classify(raw: &str, registry: &CodecRegistry) -> Result<Inbound, DecodeError> {
    if raw.trim() == STREAM_END {
        return Ok(Inbound::StreamEnd);
    }
    let qualified = qualify_top_level(raw);
    let mut cursor = XmlCursor::new(&qualified);
    loop {
        match cursor.next()? {
            Some(EventKind::Start) => break,
            Some(EventKind::Text) => continue,
            _ => return Err(DecodeError::Xml("no top-level element".to_string())),
        }
    }

    if cursor.is_start("stream", ns::STREAM) {
        // The header is never closed; only its attributes matter.
        return Ok(Inbound::StreamHeader {
            id: cursor.attr("id").map(str::to_string),
            from: cursor.attr("from").map(str::to_string),
        });
    }

    if cursor.namespace() == ns::CLIENT
        && matches!(cursor.name(), "message" | "presence" | "iq")
    {
        return Ok(Inbound::Stanza(Stanza::from_cursor(&mut cursor, registry)?));
    }

    let element = Element::from_cursor(&mut cursor)?;
    classify_element(element)
}

fn classify_element(element: Element) -> Result<Inbound, DecodeError> {
    let inbound = match (element.name(), element.namespace()) {
        ("features", ns::STREAM) => Inbound::Features(StreamFeatures::from_element(&element)),
        ("error", ns::STREAM) => {
            let (condition, text) = defined_condition(&element, ns::STREAMS_ERRORS);
            Inbound::StreamError { condition, text }
        }
        ("proceed", ns::TLS) => Inbound::TlsProceed,
        ("failure", ns::TLS) => Inbound::TlsFailure,
        ("challenge", ns::SASL) => Inbound::SaslChallenge(decode_base64(&element.text())?),
        ("success", ns::SASL) => Inbound::SaslSuccess(decode_base64(&element.text())?),
        ("failure", ns::SASL) => {
            let (condition, text) = defined_condition(&element, ns::SASL);
            Inbound::SaslFailure { condition, text }
        }
        ("enabled", ns::SM) => Inbound::SmEnabled(SmEnabled {
            id: element.attr("id").map(str::to_string),
            resume: matches!(element.attr("resume"), Some("true") | Some("1")),
            max: element.attr("max").and_then(|m| m.parse().ok()),
            location: element.attr("location").map(str::to_string),
        }),
        ("failed", ns::SM) => Inbound::SmFailed {
            h: element.attr("h").and_then(|h| h.parse().ok()),
            condition: element
                .children()
                .find(|c| c.namespace() == ns::STANZAS)
                .map(|c| c.name().to_string()),
        },
        ("resumed", ns::SM) => Inbound::SmResumed {
            previd: required_attr(&element, "previd")?.to_string(),
            h: parse_h(&element)?,
        },
        ("a", ns::SM) => Inbound::SmAck(parse_h(&element)?),
        ("r", ns::SM) => Inbound::SmRequest,
        _ => Inbound::Unknown(element),
    };
    Ok(inbound)
}

fn required_attr<'a>(element: &'a Element, attribute: &str) -> Result<&'a str, DecodeError> {
    element.attr(attribute).ok_or_else(|| DecodeError::MissingAttribute {
        element: element.name().to_string(),
        attribute: attribute.to_string(),
    })
}

fn parse_h(element: &Element) -> Result<u32, DecodeError> {
    let h = required_attr(element, "h")?;
    h.parse().map_err(|_| DecodeError::InvalidAttribute {
        element: element.name().to_string(),
        attribute: "h".to_string(),
        value: h.to_string(),
    })
}

/// First child in `namespace` other than `<text/>`, plus the text if any.
fn defined_condition(element: &Element, namespace: &str) -> (String, Option<String>) {
    let condition = element
        .children()
        .find(|c| c.namespace() == namespace && c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .get_child("text", namespace)
        .map(Element::text)
        .filter(|t| !t.is_empty());
    (condition, text)
}

fn decode_base64(text: &str) -> Result<Vec<u8>, DecodeError> {
    let text = text.trim();
    // RFC 6120 §6.4.2: "=" stands for an empty payload.
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text)
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

fn encode_base64(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64.encode(data)
    }
}

/// Opening `<stream:stream>` header addressed to `domain`.
pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        quick_xml::escape::escape(domain)
    )
}

pub fn starttls() -> String {
    Element::new("starttls", ns::TLS).to_xml()
}

/// `<auth/>` with an optional initial response.
pub fn sasl_auth(mechanism: &str, initial_response: Option<&[u8]>) -> String {
    let auth = Element::new("auth", ns::SASL).with_attr("mechanism", mechanism);
    match initial_response {
        Some(data) => auth.with_text(encode_base64(data)).to_xml(),
        None => auth.to_xml(),
    }
}

pub fn sasl_response(data: &[u8]) -> String {
    let response = Element::new("response", ns::SASL);
    if data.is_empty() {
        response.to_xml()
    } else {
        response.with_text(BASE64.encode(data)).to_xml()
    }
}

pub fn sasl_abort() -> String {
    Element::new("abort", ns::SASL).to_xml()
}

/// Resource binding request.
pub fn bind_request(resource: Option<&str>) -> Stanza {
    let mut bind = Element::new("bind", ns::BIND);
    if let Some(resource) = resource {
        bind.append_child(Element::new("resource", ns::BIND).with_text(resource));
    }
    Stanza::iq("set").with_element(bind)
}

/// The full JID from a bind result.
pub fn bound_jid(reply: &Stanza) -> Option<String> {
    reply
        .get_element("bind", ns::BIND)?
        .get_child("jid", ns::BIND)
        .map(|jid| jid.text().trim().to_string())
}

pub fn sm_enable(resume: bool, max: Option<u32>) -> String {
    let mut enable = Element::new("enable", ns::SM);
    if resume {
        enable.set_attr("resume", "true");
        if let Some(max) = max {
            enable.set_attr("max", max.to_string());
        }
    }
    enable.to_xml()
}

pub fn sm_resume(previd: &str, h: u32) -> String {
    Element::new("resume", ns::SM)
        .with_attr("previd", previd)
        .with_attr("h", h.to_string())
        .to_xml()
}

pub fn sm_ack(h: u32) -> String {
    Element::new("a", ns::SM).with_attr("h", h.to_string()).to_xml()
}

pub fn sm_request() -> String {
    Element::new("r", ns::SM).to_xml()
}
