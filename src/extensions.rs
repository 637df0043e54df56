//! Built-in extension payloads: XMPP Ping (XEP-0199) and Delayed Delivery (XEP-0203).

use std::any::Any;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::registry::{DecodeContext, ExtensionDecoder, ExtensionPayload};
use crate::xml::{ns, Element, XmlCursor};

/// `<ping xmlns='urn:xmpp:ping'/>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping;

impl ExtensionPayload for Ping {
    fn to_element(&self) -> Element {
        Element::new("ping", ns::PING)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct PingDecoder;

impl ExtensionDecoder for PingDecoder {
    fn decode(
        &self,
        cursor: &mut XmlCursor<'_>,
        _context: &DecodeContext<'_>,
    ) -> Result<Arc<dyn ExtensionPayload>, DecodeError> {
        cursor.skip_element()?;
        Ok(Arc::new(Ping))
    }
}

/// `<delay xmlns='urn:xmpp:delay' stamp='…' from='…'>reason</delay>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delay {
    pub stamp: String,
    pub from: Option<String>,
    pub reason: Option<String>,
}

impl ExtensionPayload for Delay {
    fn to_element(&self) -> Element {
        let mut el = Element::new("delay", ns::DELAY).with_attr("stamp", self.stamp.clone());
        if let Some(from) = &self.from {
            el.set_attr("from", from.clone());
        }
        match &self.reason {
            Some(reason) => el.with_text(reason.clone()),
            None => el,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DelayDecoder;

impl ExtensionDecoder for DelayDecoder {
    fn decode(
        &self,
        cursor: &mut XmlCursor<'_>,
        _context: &DecodeContext<'_>,
    ) -> Result<Arc<dyn ExtensionPayload>, DecodeError> {
        let stamp = cursor
            .attr("stamp")
            .ok_or_else(|| DecodeError::MissingAttribute {
                element: "delay".to_string(),
                attribute: "stamp".to_string(),
            })?
            .to_string();
        // XEP-0082 timestamps always carry a date and a 'T' separator.
        if !stamp.contains('T') {
            return Err(DecodeError::InvalidAttribute {
                element: "delay".to_string(),
                attribute: "stamp".to_string(),
                value: stamp,
            });
        }
        let from = cursor.attr("from").map(str::to_string);
        let reason = cursor.read_text()?;
        Ok(Arc::new(Delay {
            stamp,
            from,
            reason: (!reason.is_empty()).then_some(reason),
        }))
    }
}
