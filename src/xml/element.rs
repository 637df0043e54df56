//! Minimal owned XML tree used for protocol elements and unknown payloads.

use std::fmt::Write as _;

use quick_xml::escape::escape;

use super::cursor::{EventKind, XmlCursor};
use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, namespace))
    }

    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.get_child(name, namespace).is_some()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Parse a complete element from a string.
    pub fn parse(xml: &str) -> Result<Element, DecodeError> {
        let mut cursor = XmlCursor::new(xml);
        loop {
            match cursor.next()? {
                Some(EventKind::Start) => return Element::from_cursor(&mut cursor),
                Some(EventKind::Text) => continue,
                Some(EventKind::End) | None => {
                    return Err(DecodeError::Xml("no root element".to_string()))
                }
            }
        }
    }

    /// Build an element from a cursor positioned on its start tag. On return the
    /// cursor sits on the matching end tag.
    pub fn from_cursor(cursor: &mut XmlCursor<'_>) -> Result<Element, DecodeError> {
        let depth = cursor.depth();
        let mut root = Element::new(cursor.name(), cursor.namespace());
        root.attributes = cursor.attributes().to_vec();

        // Stack of partially built ancestors below `root`.
        let mut stack: Vec<Element> = Vec::new();
        loop {
            match cursor.next()? {
                Some(EventKind::Start) => {
                    let mut child = Element::new(cursor.name(), cursor.namespace());
                    child.attributes = cursor.attributes().to_vec();
                    stack.push(child);
                }
                Some(EventKind::Text) => {
                    let text = Node::Text(cursor.text().to_string());
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(text),
                        None => root.children.push(text),
                    }
                }
                Some(EventKind::End) => {
                    if cursor.depth() == depth {
                        return Ok(root);
                    }
                    let finished = stack
                        .pop()
                        .ok_or_else(|| DecodeError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(finished)),
                        None => root.children.push(Node::Element(finished)),
                    }
                }
                None => return Err(DecodeError::UnexpectedEnd(root.name)),
            }
        }
    }

    /// Serialise to a string. The namespace is declared on the root and
    /// wherever a child's namespace differs from its parent's.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, None);
        out
    }

    pub(crate) fn write_xml(&self, out: &mut String, parent_namespace: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        if parent_namespace != Some(self.namespace.as_str()) && !self.namespace.is_empty() {
            let _ = write!(out, " xmlns='{}'", escape(&self.namespace));
        }
        for (k, v) in &self.attributes {
            let _ = write!(out, " {}='{}'", k, escape(v));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(out, Some(&self.namespace)),
                Node::Text(t) => out.push_str(&escape(t)),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}
