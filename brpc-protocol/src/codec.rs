//! Pluggable body codecs.
//!
//! A codec turns the self-describing in-memory document ([`Value`]) into
//! frame payload bytes and back. Headers and bodies both go through the
//! codec negotiated in the handshake; the [`CodecRegistry`] maps the
//! handshake's content-type tag to an implementation.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Content type of the default binary codec.
pub const CBOR: &str = "application/cbor";

/// Content type of the JSON codec.
pub const JSON: &str = "application/json";

/// Serializes payloads for one content type.
pub trait Codec: Send + Sync + 'static {
    /// Tag exchanged in the handshake.
    fn content_type(&self) -> &'static str;

    /// Encodes a document into payload bytes.
    fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError>;

    /// Decodes payload bytes into a document.
    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError>;
}

/// Converts any serializable value into a document.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, ProtocolError> {
    Ok(serde_json::to_value(value)?)
}

/// Converts a document into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    Ok(serde_json::from_value(value)?)
}

/// Encodes a typed value with the given codec.
pub fn encode<T: Serialize + ?Sized>(codec: &dyn Codec, value: &T) -> Result<Bytes, ProtocolError> {
    codec.encode(&to_value(value)?)
}

/// Decodes a typed value with the given codec.
pub fn decode<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, ProtocolError> {
    from_value(codec.decode(bytes)?)
}

/// Binary object encoding (CBOR).
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn content_type(&self) -> &'static str {
        CBOR
    }

    fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError> {
        let mut out = Vec::with_capacity(64);
        ciborium::ser::into_writer(value, &mut out).map_err(|e| ProtocolError::Encode {
            codec: CBOR,
            message: e.to_string(),
        })?;
        Ok(Bytes::from(out))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode {
            codec: CBOR,
            message: e.to_string(),
        })
    }
}

/// Plain JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON
    }

    fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode {
                codec: JSON,
                message: e.to_string(),
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode {
            codec: JSON,
            message: e.to_string(),
        })
    }
}

/// Maps content-type tags to codecs.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates a registry without any codec.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers a codec under its content type, replacing any previous one.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        tracing::debug!("Registering codec {}", codec.content_type());
        self.codecs.insert(codec.content_type().to_string(), codec);
    }

    /// Returns the codec for a tag, if registered.
    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(content_type).cloned()
    }

    /// Returns the codec for a tag or an `UnknownCodec` error.
    pub fn resolve(&self, content_type: &str) -> Result<Arc<dyn Codec>, ProtocolError> {
        self.get(content_type)
            .ok_or_else(|| ProtocolError::UnknownCodec(content_type.to_string()))
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.codecs.contains_key(content_type)
    }

    /// Returns the registered tags, sorted.
    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CborCodec));
        registry.register(Arc::new(JsonCodec));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("content_types", &self.content_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
        tags: Vec<String>,
    }

    #[test]
    fn test_cbor_header_roundtrip() {
        let header = Header::new("Foo.Sum", 42).with_error("boom");
        let bytes = encode(&CborCodec, &header).unwrap();
        let decoded: Header = decode(&CborCodec, &bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_cbor_is_binary() {
        let bytes = CborCodec.encode(&json!({"seq": 1})).unwrap();
        // map(1), text(3) "seq", unsigned(1)
        assert_eq!(bytes.as_ref(), b"\xa1\x63seq\x01");
    }

    #[test]
    fn test_json_body_roundtrip() {
        let args = Args {
            num1: -3,
            num2: 9,
            tags: vec!["a".into(), "b".into()],
        };
        let bytes = encode(&JsonCodec, &args).unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("\"num1\":-3"));
        let decoded: Args = decode(&JsonCodec, &bytes).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_decode_garbage() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { codec: JSON, .. }));

        let err = CborCodec.decode(b"\xff\xff").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { codec: CBOR, .. }));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.content_types(), vec![CBOR, JSON]);
        assert_eq!(registry.resolve(CBOR).unwrap().content_type(), CBOR);
        assert!(matches!(
            registry.resolve("application/gob"),
            Err(ProtocolError::UnknownCodec(_))
        ));
    }

    #[test]
    fn test_registry_extension() {
        struct Upper;
        impl Codec for Upper {
            fn content_type(&self) -> &'static str {
                "text/upper"
            }
            fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError> {
                Ok(Bytes::from(value.to_string().to_uppercase()))
            }
            fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
                Ok(serde_json::from_slice(&bytes.to_ascii_lowercase())?)
            }
        }

        let mut registry = CodecRegistry::empty();
        assert!(!registry.contains("text/upper"));
        registry.register(Arc::new(Upper));

        let codec = registry.resolve("text/upper").unwrap();
        let bytes = codec.encode(&json!("abc")).unwrap();
        assert_eq!(bytes.as_ref(), b"\"ABC\"");
        assert_eq!(codec.decode(&bytes).unwrap(), json!("abc"));
    }
}
