//! Cutting the inbound byte stream into top-level elements, and the RFC 7395
//! WebSocket framing.
//!
//! Everything above the transport speaks TCP stream framing: a
//! `<stream:stream>` header, `stream:`-prefixed top-level elements and a
//! closing `</stream:stream>`. The WebSocket transport converts at the edge
//! with [`ws_to_stream`] and [`stream_to_ws`].

use std::borrow::Cow;

use quick_xml::errors::Error as XmlError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::error::TransportError;
use crate::protocol::STREAM_END;
use crate::xml::ns;

const FRAMING_CLOSE: &str = r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#;

/// Stream attributes that survive a framing translation.
const STREAM_ATTRIBUTES: [&str; 5] = ["to", "from", "id", "version", "xml:lang"];

/// `(name, value)` pairs of the first tag in `tag`, restricted to
/// [`STREAM_ATTRIBUTES`]. `None` if `tag` does not start with a tag.
fn stream_attributes(tag: &str) -> Option<Vec<(String, String)>> {
    let mut reader = Reader::from_str(tag);
    reader.config_mut().check_end_names = false;
    let start: BytesStart<'_> = match reader.read_event() {
        Ok(Event::Start(e)) | Ok(Event::Empty(e)) => e.into_owned(),
        _ => return None,
    };
    Some(
        start
            .attributes()
            .flatten()
            .filter_map(|attr| {
                let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                STREAM_ATTRIBUTES.contains(&name.as_str()).then(|| {
                    let value = attr
                        .unescape_value()
                        .map(Cow::into_owned)
                        .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                    (name, value)
                })
            })
            .collect(),
    )
}

fn push_attribute(out: &mut String, name: &str, value: &str, quote: char) {
    out.push(' ');
    out.push_str(name);
    out.push('=');
    out.push(quote);
    out.push_str(&quick_xml::escape::escape(value));
    out.push(quote);
}

/// Inbound WebSocket frame to stream framing.
///
/// `<open/>` becomes a `<stream:stream>` header (always carrying `version`),
/// `<close/>` becomes `</stream:stream>`, anything else is returned untouched.
pub fn ws_to_stream(frame: &str) -> Cow<'_, str> {
    let trimmed = frame.trim();
    if trimmed.starts_with("<close") {
        return Cow::Borrowed(STREAM_END);
    }
    let is_open = ["<open ", "<open>", "<open/"].iter().any(|p| trimmed.starts_with(p));
    if !is_open {
        return Cow::Borrowed(frame);
    }

    let attributes = stream_attributes(trimmed).unwrap_or_default();
    let mut header = String::from("<?xml version='1.0'?><stream:stream");
    for (name, value) in &attributes {
        push_attribute(&mut header, name, value, '\'');
    }
    if !attributes.iter().any(|(name, _)| name == "version") {
        push_attribute(&mut header, "version", "1.0", '\'');
    }
    header.push_str(" xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>");
    Cow::Owned(header)
}

/// Outbound stream framing to a WebSocket frame.
///
/// The header becomes `<open/>`, the stream end becomes `<close/>`, and
/// `stream:`-prefixed elements get an explicit namespace instead.
pub fn stream_to_ws(xml: &str) -> Cow<'_, str> {
    let trimmed = xml.trim();
    if trimmed == STREAM_END {
        return Cow::Borrowed(FRAMING_CLOSE);
    }

    let without_decl = skip_declaration(trimmed);
    if without_decl.starts_with("<stream:stream") {
        if let Some(attributes) = stream_attributes(without_decl) {
            let mut open = String::from(r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing""#);
            for (name, value) in &attributes {
                push_attribute(&mut open, name, value, '"');
            }
            open.push_str("/>");
            return Cow::Owned(open);
        }
    }

    match unprefix_stream_element(trimmed) {
        Some(element) => Cow::Owned(element),
        None => Cow::Borrowed(xml),
    }
}

/// Make a top-level element parseable on its own.
///
/// Cut out of a TCP stream, an element has lost the `stream` prefix binding
/// and the default `jabber:client` namespace declared by the header. The
/// prefix is replaced by an explicit namespace and a stanza without a default
/// namespace gets `jabber:client`.
pub fn qualify_top_level(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim();
    if let Some(element) = unprefix_stream_element(trimmed) {
        return Cow::Owned(element);
    }
    if !trimmed.starts_with('<') || trimmed.starts_with("<?") || trimmed.starts_with("<stream:stream") {
        return Cow::Borrowed(text);
    }
    match with_default_namespace(trimmed, ns::CLIENT) {
        Some(element) => Cow::Owned(element),
        None => Cow::Borrowed(text),
    }
}

fn skip_declaration(text: &str) -> &str {
    match text.strip_prefix("<?xml").and_then(|rest| rest.split_once("?>")) {
        Some((_, rest)) => rest.trim_start(),
        None => text,
    }
}

/// `<stream:features>…</stream:features>` to
/// `<features xmlns="http://etherx.jabber.org/streams">…</features>`.
fn unprefix_stream_element(element: &str) -> Option<String> {
    if !element.starts_with("<stream:") || element.starts_with("<stream:stream") {
        return None;
    }
    // Only the element's own tags carry the prefix; nested children declare
    // their own namespaces.
    let unprefixed = element.replace("</stream:", "</").replacen("<stream:", "<", 1);
    Some(with_default_namespace(&unprefixed, ns::STREAM).unwrap_or(unprefixed))
}

/// Insert `xmlns` into the root tag unless it already declares one.
fn with_default_namespace(element: &str, namespace: &str) -> Option<String> {
    let root_end = element.find('>').unwrap_or(element.len());
    if element[..root_end].contains("xmlns=") {
        return None;
    }
    let name_end = element.find([' ', '>', '/', '\t', '\n', '\r'])?;
    Some(format!(
        r#"{} xmlns="{}"{}"#,
        &element[..name_end],
        namespace,
        &element[name_end..]
    ))
}

fn is_stream_root(tag_name: &[u8]) -> bool {
    tag_name == b"stream:stream" || tag_name == b"stream"
}

/// One complete unit cut from the buffer. Invalid UTF-8 is a framing error;
/// the stream is UTF-8 (RFC 6120 §11.6).
fn unit(bytes: &[u8], used: usize) -> Result<Option<(String, usize)>, TransportError> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        warn!(error = %e, "Invalid UTF-8 on the stream");
        TransportError::Framing(format!("invalid UTF-8: {}", e))
    })?;
    Ok(Some((text.to_string(), used)))
}

/// Find the first complete top-level unit in `buffer`.
///
/// A unit is the stream header (with any XML declaration before it), the
/// stream end tag, or one complete element. Returns the unit and how many
/// bytes it used, or `None` when more input is needed. Malformed XML cannot be
/// resynchronised and is an error.
pub fn split_element(buffer: &[u8]) -> Result<Option<(String, usize)>, TransportError> {
    ElementSplitter::default().next(buffer)
}

/// Incremental [`split_element`] for a buffer that only grows between calls.
///
/// Remembers where parsing stopped, so each read scans only the new bytes.
/// Must be [`reset`](Self::reset) whenever the buffer is cleared; returning a
/// unit resets it, since the caller drains those bytes.
#[derive(Debug, Default)]
pub struct ElementSplitter {
    /// Start of the first event not yet completely parsed.
    resume: usize,
    depth: u32,
    element_start: Option<usize>,
}

impl ElementSplitter {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn next(&mut self, buffer: &[u8]) -> Result<Option<(String, usize)>, TransportError> {
        let found = self.scan(buffer);
        if !matches!(found, Ok(None)) {
            self.reset();
        }
        found
    }

    fn scan(&mut self, buffer: &[u8]) -> Result<Option<(String, usize)>, TransportError> {
        // The end tag arrives without a matching start in this buffer.
        if self.resume == 0 {
            if let Some(offset) = buffer.iter().position(|b| !b.is_ascii_whitespace()) {
                if buffer[offset..].starts_with(STREAM_END.as_bytes()) {
                    return Ok(Some((STREAM_END.to_string(), offset + STREAM_END.len())));
                }
            }
        }

        let base = self.resume.min(buffer.len());
        let mut reader = Reader::from_reader(&buffer[base..]);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;
        // End tags of an element opened before `base` look unmatched to a fresh reader.
        reader.config_mut().allow_unmatched_ends = true;

        loop {
            let before = base + reader.buffer_position() as usize;
            let event = reader.read_event();
            let after = base + reader.buffer_position() as usize;
            match event {
                Ok(Event::Start(e)) if self.element_start.is_none() && is_stream_root(e.name().as_ref()) => {
                    return unit(&buffer[..after], after);
                }
                Ok(Event::Start(_)) => {
                    if self.element_start.is_none() {
                        self.element_start = Some(before);
                    }
                    self.depth += 1;
                }
                Ok(Event::Empty(_)) if self.element_start.is_none() => {
                    return unit(&buffer[before..after], after);
                }
                Ok(Event::End(e)) if self.element_start.is_none() => {
                    if is_stream_root(e.name().as_ref()) {
                        return Ok(Some((STREAM_END.to_string(), after)));
                    }
                    warn!(offset = before, "End tag without a start on the stream");
                    return Err(TransportError::Framing("unmatched end tag".to_string()));
                }
                Ok(Event::End(_)) => {
                    self.depth = self.depth.saturating_sub(1);
                    if let (Some(start), 0) = (self.element_start, self.depth) {
                        return unit(&buffer[start..after], after);
                    }
                }
                Ok(Event::Eof) => {
                    self.resume = after;
                    return Ok(None);
                }
                Ok(_) => {}
                // The buffer stops inside a tag, comment or CDATA section.
                Err(XmlError::Syntax(_)) => {
                    self.resume = before;
                    return Ok(None);
                }
                Err(e) => {
                    warn!(error = %e, "Unrecoverable XML on the stream");
                    return Err(TransportError::Framing(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split `input` completely, asserting every byte is accounted for.
    fn split_all(input: &str) -> Vec<String> {
        let mut units = Vec::new();
        let mut rest = input.as_bytes();
        while let Some((unit, used)) = split_element(rest).unwrap() {
            units.push(unit);
            rest = &rest[used..];
        }
        assert!(rest.iter().all(u8::is_ascii_whitespace), "left over: {:?}", rest);
        units
    }

    #[test]
    fn test_split_a_whole_session() {
        let units = split_all(concat!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='abc' version='1.0'>",
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>\n",
            "<r xmlns='urn:xmpp:sm:3'/>",
            "<message from='romeo@montague.lit'><body>Wherefore</body></message>",
            "</stream:stream>",
        ));
        assert_eq!(units.len(), 5);
        assert!(units[0].starts_with("<?xml") && units[0].ends_with("version='1.0'>"));
        assert!(units[1].starts_with("<stream:features>") && units[1].ends_with("</stream:features>"));
        assert_eq!(units[2], "<r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(units[3], "<message from='romeo@montague.lit'><body>Wherefore</body></message>");
        assert_eq!(units[4], STREAM_END);
    }

    #[test]
    fn test_partial_input_waits_for_more() {
        for partial in [
            "",
            "  \n",
            "<iq type='get' id='1'><query xmlns='jabber:iq:roster'>",
            "<presence ty",
            "<message><body><![CDATA[still going",
        ] {
            assert_eq!(split_element(partial.as_bytes()).unwrap(), None, "{:?}", partial);
        }
    }

    #[test]
    fn test_nested_same_name_elements() {
        let units = split_all("<iq id='x'><iq-like><iq/></iq-like></iq><presence/>");
        assert_eq!(units, vec!["<iq id='x'><iq-like><iq/></iq-like></iq>", "<presence/>"]);
    }

    #[test]
    fn test_entities_and_cdata_kept_verbatim() {
        let xml = "<message><body>a &lt; b <![CDATA[<c>]]></body></message>";
        assert_eq!(split_all(xml), vec![xml]);
    }

    #[test]
    fn test_end_tag_after_whitespace() {
        assert_eq!(
            split_element(b"\r\n</stream:stream>").unwrap(),
            Some((STREAM_END.to_string(), 18))
        );
    }

    #[test]
    fn test_stray_end_tag_is_a_framing_error() {
        assert!(matches!(
            split_element(b"</iq><presence/>"),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_a_framing_error() {
        assert!(matches!(
            split_element(b"<message><body>\xff\xfe</body></message>"),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn test_incremental_split_across_single_byte_reads() {
        let input = "<message to='a'><body>x &amp; y<![CDATA[<z>]]></body><!-- note --></message>  <presence/></stream:stream>";
        let mut splitter = ElementSplitter::default();
        let mut buffer = Vec::new();
        let mut units = Vec::new();
        for byte in input.bytes() {
            buffer.push(byte);
            while let Some((unit, used)) = splitter.next(&buffer).unwrap() {
                buffer.drain(..used);
                units.push(unit);
            }
        }
        assert_eq!(
            units,
            vec![
                "<message to='a'><body>x &amp; y<![CDATA[<z>]]></body><!-- note --></message>",
                "<presence/>",
                STREAM_END,
            ]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_splitter_does_not_rescan_parsed_input() {
        let mut splitter = ElementSplitter::default();
        let mut buffer = b"<iq id='1'><query xmlns='jabber:iq:roster'><item jid='a@b'/>".to_vec();
        assert_eq!(splitter.next(&buffer).unwrap(), None);
        assert_eq!(splitter.resume, buffer.len());
        assert_eq!(splitter.depth, 2);

        buffer.extend_from_slice(b"</query></iq>");
        let (unit, used) = splitter.next(&buffer).unwrap().unwrap();
        assert_eq!(used, buffer.len());
        assert!(unit.starts_with("<iq id='1'>") && unit.ends_with("</iq>"));
        assert_eq!(splitter.resume, 0);
    }

    #[test]
    fn test_ws_open_becomes_stream_header() {
        let header = ws_to_stream(
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="capulet.lit" id="ws-7" xml:lang="en"/>"#,
        );
        assert_eq!(
            header,
            "<?xml version='1.0'?><stream:stream from='capulet.lit' id='ws-7' xml:lang='en' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>"
        );
    }

    #[test]
    fn test_ws_close_and_passthrough() {
        assert_eq!(ws_to_stream(FRAMING_CLOSE), STREAM_END);
        let stanza = "<message xmlns='jabber:client'><body>x</body></message>";
        assert!(matches!(ws_to_stream(stanza), Cow::Borrowed(s) if s == stanza));
    }

    #[test]
    fn test_stream_header_becomes_ws_open() {
        let open = stream_to_ws(
            "<?xml version='1.0'?><stream:stream to='capulet.lit' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        );
        assert_eq!(
            open,
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" to="capulet.lit" version="1.0"/>"#
        );
        assert_eq!(stream_to_ws(STREAM_END), FRAMING_CLOSE);
    }

    #[test]
    fn test_stream_error_is_unprefixed_for_ws() {
        let frame = stream_to_ws(
            "<stream:error><policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        );
        assert_eq!(
            frame,
            r#"<error xmlns="http://etherx.jabber.org/streams"><policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></error>"#
        );
        let iq = "<iq type='get' id='p'><ping xmlns='urn:xmpp:ping'/></iq>";
        assert!(matches!(stream_to_ws(iq), Cow::Borrowed(_)));
    }

    #[test]
    fn test_qualify_top_level() {
        assert_eq!(
            qualify_top_level("<stream:features><sm xmlns='urn:xmpp:sm:3'/></stream:features>"),
            r#"<features xmlns="http://etherx.jabber.org/streams"><sm xmlns='urn:xmpp:sm:3'/></features>"#
        );
        assert_eq!(
            qualify_top_level("<iq type='result' id='b1'/>"),
            r#"<iq xmlns="jabber:client" type='result' id='b1'/>"#
        );
        assert_eq!(qualify_top_level("<presence/>"), r#"<presence xmlns="jabber:client"/>"#);
        assert!(matches!(qualify_top_level("<enabled xmlns='urn:xmpp:sm:3' id='s'/>"), Cow::Borrowed(_)));
    }
}
