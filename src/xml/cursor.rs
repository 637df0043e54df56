//! Pull cursor over a single top-level XML element.
//!
//! Wraps quick-xml's namespace-aware reader and exposes exactly what the
//! stanza layer and extension codecs need: the current event kind, the
//! element name and resolved namespace, attribute lookup, nesting depth and
//! the byte offsets of the current event so an unparsed subtree can be
//! captured verbatim.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::error::DecodeError;

/// Kind of the event the cursor is positioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    End,
    Text,
}

pub struct XmlCursor<'a> {
    input: &'a str,
    reader: NsReader<&'a [u8]>,
    kind: Option<EventKind>,
    name: String,
    namespace: String,
    attributes: Vec<(String, String)>,
    text: String,
    /// Number of currently open elements.
    open: usize,
    /// Depth reported for the current event (1 = the top-level element).
    depth: usize,
    event_start: usize,
}

impl<'a> XmlCursor<'a> {
    pub fn new(input: &'a str) -> Self {
        let mut reader = NsReader::from_str(input);
        reader.config_mut().expand_empty_elements = true;
        reader.config_mut().trim_text(false);
        Self {
            input,
            reader,
            kind: None,
            name: String::new(),
            namespace: String::new(),
            attributes: Vec::new(),
            text: String::new(),
            open: 0,
            depth: 0,
            event_start: 0,
        }
    }

    /// Advance to the next start, end or text event.
    ///
    /// Declarations, comments and processing instructions are skipped.
    /// Returns `Ok(None)` at end of input.
    pub fn next(&mut self) -> Result<Option<EventKind>, DecodeError> {
        loop {
            let start = self.reader.buffer_position() as usize;
            let (resolved, event) = self
                .reader
                .read_resolved_event()
                .map_err(|e| DecodeError::Xml(e.to_string()))?;
            let namespace = namespace_of(&resolved);

            match event {
                Event::Start(e) => {
                    self.open += 1;
                    self.depth = self.open;
                    self.event_start = start;
                    self.name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    self.namespace = namespace;
                    self.attributes.clear();
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| DecodeError::Xml(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        if key == "xmlns" || key.starts_with("xmlns:") {
                            continue;
                        }
                        let value = attr
                            .unescape_value()
                            .map_err(|e| DecodeError::Xml(e.to_string()))?
                            .into_owned();
                        self.attributes.push((key, value));
                    }
                    self.text.clear();
                    self.kind = Some(EventKind::Start);
                    return Ok(self.kind);
                }
                Event::End(e) => {
                    self.depth = self.open;
                    self.open = self.open.saturating_sub(1);
                    self.event_start = start;
                    self.name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    self.namespace = namespace;
                    self.attributes.clear();
                    self.text.clear();
                    self.kind = Some(EventKind::End);
                    return Ok(self.kind);
                }
                Event::Text(e) => {
                    self.depth = self.open;
                    self.event_start = start;
                    self.text = e
                        .unescape()
                        .map_err(|e| DecodeError::Xml(e.to_string()))?
                        .into_owned();
                    self.kind = Some(EventKind::Text);
                    return Ok(self.kind);
                }
                Event::CData(e) => {
                    self.depth = self.open;
                    self.event_start = start;
                    self.text = String::from_utf8_lossy(&e).into_owned();
                    self.kind = Some(EventKind::Text);
                    return Ok(self.kind);
                }
                Event::Eof => {
                    self.kind = None;
                    return Ok(None);
                }
                Event::Empty(_)
                | Event::Decl(_)
                | Event::PI(_)
                | Event::Comment(_)
                | Event::DocType(_) => continue,
            }
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    /// Local name of the current start or end element.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved namespace of the current element; empty when unbound.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Value of an attribute of the current start element, by qualified name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Byte offset into the input where the current event begins.
    pub fn event_start(&self) -> usize {
        self.event_start
    }

    /// Byte offset just past the last consumed event.
    pub fn position(&self) -> usize {
        self.reader.buffer_position() as usize
    }

    pub fn input(&self) -> &'a str {
        self.input
    }

    /// Whether the cursor sits on the start of an element with this name and namespace.
    pub fn is_start(&self, name: &str, namespace: &str) -> bool {
        self.kind == Some(EventKind::Start) && self.name == name && self.namespace == namespace
    }

    /// Advance from the current start element to its matching end element.
    ///
    /// Returns the raw input span of the whole element, byte for byte. If the
    /// cursor is already on an end event at `depth`, nothing is consumed.
    pub fn skip_element(&mut self) -> Result<&'a str, DecodeError> {
        let depth = self.depth;
        let start = self.event_start;
        let name = self.name.clone();
        if self.kind == Some(EventKind::End) {
            return Ok(&self.input[start..self.position()]);
        }
        if self.kind != Some(EventKind::Start) {
            return Err(DecodeError::Xml("skip_element called off a start tag".to_string()));
        }
        self.skip_to_end(depth, &name)?;
        Ok(&self.input[start..self.position()])
    }

    /// Advance until the end event of the element opened at `depth`.
    ///
    /// Used to resynchronise after a decoder bailed out somewhere inside an element.
    pub fn skip_to_end(&mut self, depth: usize, name: &str) -> Result<(), DecodeError> {
        if self.kind == Some(EventKind::End) && self.depth == depth {
            return Ok(());
        }
        loop {
            match self.next()? {
                Some(EventKind::End) if self.depth == depth => return Ok(()),
                Some(_) => continue,
                None => return Err(DecodeError::UnexpectedEnd(name.to_string())),
            }
        }
    }

    /// Read the character content of the current element up to its end tag.
    ///
    /// Child elements are skipped; only direct text is collected.
    pub fn read_text(&mut self) -> Result<String, DecodeError> {
        let depth = self.depth;
        let name = self.name.clone();
        let mut out = String::new();
        loop {
            match self.next()? {
                Some(EventKind::Text) if self.depth == depth => out.push_str(&self.text),
                Some(EventKind::Start) => {
                    self.skip_element()?;
                }
                Some(EventKind::End) if self.depth == depth => return Ok(out),
                Some(_) => continue,
                None => return Err(DecodeError::UnexpectedEnd(name)),
            }
        }
    }
}

fn namespace_of(resolved: &ResolveResult) -> String {
    match resolved {
        ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.as_ref()).into_owned(),
        ResolveResult::Unbound | ResolveResult::Unknown(_) => String::new(),
    }
}
