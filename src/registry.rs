//! Extension codec registry.
//!
//! Maps `(element name, namespace)` to the decoder for that extension payload.
//! Lookups happen on the inbound path for every stanza child; registration
//! happens during application setup and is rare, so the table sits behind a
//! read-biased `RwLock` and decoders are handed out as cheap `Arc` clones.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::DecodeError;
use crate::extensions::{DelayDecoder, PingDecoder};
use crate::xml::{ns, Element, XmlCursor};

/// A typed extension payload produced by a decoder.
pub trait ExtensionPayload: fmt::Debug + Send + Sync + 'static {
    /// Encode back to an element (used when the stanza is serialised).
    fn to_element(&self) -> Element;

    fn as_any(&self) -> &dyn Any;
}

/// What a decoder knows about where its element sits.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Namespace of the enclosing stanza (normally `jabber:client`).
    pub enclosing_namespace: &'a str,
    /// Local name of the enclosing stanza (`message`, `presence` or `iq`).
    pub stanza_name: &'a str,
}

/// Decodes one extension element.
///
/// The cursor is positioned on the element's start tag when `decode` is
/// called. On success it should be left on the matching end tag; on error it
/// may be left anywhere inside the element, the caller resynchronises.
pub trait ExtensionDecoder: Send + Sync {
    fn decode(
        &self,
        cursor: &mut XmlCursor<'_>,
        context: &DecodeContext<'_>,
    ) -> Result<Arc<dyn ExtensionPayload>, DecodeError>;
}

type DecoderTable = HashMap<String, HashMap<String, Arc<dyn ExtensionDecoder>>>;

#[derive(Default)]
pub struct CodecRegistry {
    /// namespace -> element name -> decoder
    decoders: RwLock<DecoderTable>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in codecs (ping, delayed delivery).
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("ping", ns::PING, Arc::new(PingDecoder));
        registry.register("delay", ns::DELAY, Arc::new(DelayDecoder));
        registry
    }

    /// Install a decoder, replacing any previous one for the same key.
    ///
    /// Returns the decoder that was replaced, if any.
    pub fn register(
        &self,
        name: &str,
        namespace: &str,
        decoder: Arc<dyn ExtensionDecoder>,
    ) -> Option<Arc<dyn ExtensionDecoder>> {
        let mut table = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        table
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string(), decoder)
    }

    /// Remove the decoder for a key.
    pub fn unregister(&self, name: &str, namespace: &str) -> Option<Arc<dyn ExtensionDecoder>> {
        let mut table = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        let by_name = table.get_mut(namespace)?;
        let removed = by_name.remove(name);
        if by_name.is_empty() {
            table.remove(namespace);
        }
        removed
    }

    /// Find the decoder for a key. Absence is normal (unknown extension).
    pub fn lookup(&self, name: &str, namespace: &str) -> Option<Arc<dyn ExtensionDecoder>> {
        let table = self.decoders.read().unwrap_or_else(PoisonError::into_inner);
        table.get(namespace)?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        let table = self.decoders.read().unwrap_or_else(PoisonError::into_inner);
        table.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("decoders", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::Ping;

    struct FailingDecoder;

    impl ExtensionDecoder for FailingDecoder {
        fn decode(
            &self,
            _cursor: &mut XmlCursor<'_>,
            _context: &DecodeContext<'_>,
        ) -> Result<Arc<dyn ExtensionPayload>, DecodeError> {
            Err(DecodeError::Codec("always fails".to_string()))
        }
    }

    #[test]
    fn test_lookup_absent_key_is_none() {
        let registry = CodecRegistry::new();
        assert!(registry.lookup("ping", ns::PING).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let registry = CodecRegistry::with_defaults();
        let first = registry.lookup("ping", ns::PING).unwrap();
        let second = registry.lookup("ping", ns::PING).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_register_last_writer_wins() {
        let registry = CodecRegistry::with_defaults();
        let replacement: Arc<dyn ExtensionDecoder> = Arc::new(FailingDecoder);
        let previous = registry.register("ping", ns::PING, replacement.clone());
        assert!(previous.is_some());
        let current = registry.lookup("ping", ns::PING).unwrap();
        assert!(Arc::ptr_eq(&current, &replacement));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_same_name_different_namespace_are_distinct() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.lookup("ping", "urn:other").is_none());
        assert!(registry.lookup("delay", ns::DELAY).is_some());
    }

    #[test]
    fn test_unregister() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.unregister("ping", ns::PING).is_some());
        assert!(registry.lookup("ping", ns::PING).is_none());
        assert!(registry.unregister("ping", ns::PING).is_none());
    }

    #[test]
    fn test_concurrent_lookup_during_registration() {
        let registry = Arc::new(CodecRegistry::with_defaults());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(registry.lookup("delay", ns::DELAY).is_some());
                    }
                })
            })
            .collect();
        for i in 0..100 {
            registry.register(&format!("x{i}"), "urn:test", Arc::new(FailingDecoder));
        }
        for r in readers {
            r.join().expect("reader thread panicked");
        }
        assert_eq!(registry.len(), 102);
    }

    #[test]
    fn test_decoded_payload_round_trips() {
        let registry = CodecRegistry::with_defaults();
        let xml = Ping.to_element().to_xml();
        let mut cursor = XmlCursor::new(&xml);
        cursor.next().unwrap();
        let decoder = registry.lookup(cursor.name(), cursor.namespace()).unwrap();
        let context = DecodeContext {
            enclosing_namespace: ns::CLIENT,
            stanza_name: "iq",
        };
        let payload = decoder.decode(&mut cursor, &context).unwrap();
        assert_eq!(payload.as_any().downcast_ref::<Ping>(), Some(&Ping));
    }
}
