//! Payload encoding (§6, §10.3). The server treats payloads as opaque
//! bytes; clients must agree on a self-describing byte serialization. This
//! crate ships one documented default - JSON via `serde_json` - behind a
//! small [`Encoder`] trait so a different wire format can be substituted as
//! long as a dataset's source and sink agree.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::ClientError;

/// A documented, substitutable payload codec. The reference implementation
/// uses a language-portable object-pickling format; this crate's default
/// ([`JsonEncoder`]) plays the same role for a Rust-and-interop-friendly
/// wire payload.
pub trait Encoder {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClientError>;
    fn decode(bytes: &[u8]) -> Result<Value, ClientError>;
}

/// Default [`Encoder`]: every payload is a JSON document.
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClientError> {
        serde_json::to_vec(value).map_err(|err| ClientError::Encoding(err.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Value, ClientError> {
        serde_json::from_slice(bytes).map_err(|err| ClientError::Encoding(err.to_string()))
    }
}

/// Typed accessor for mapping-shaped snapshots (§9: the reference client
/// surfaces mapping keys as dynamic attributes via `__getattr__`; this is
/// the typed equivalent).
pub trait MappingLike {
    /// Returns the value stored under `name` if this snapshot is a mapping
    /// and contains that key.
    fn field(&self, name: &str) -> Option<&Value>;

    /// Deserializes the value stored under `name`, if present and of the
    /// requested shape.
    fn field_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.field(name).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl MappingLike for Value {
    fn field(&self, name: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(name))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_roundtrips_scalar_and_mapping_values() {
        let encoded = JsonEncoder::encode(&json!({"freq": 1.0e6, "volts": [0.1, 0.2]})).unwrap();
        let decoded = JsonEncoder::decode(&encoded).unwrap();
        assert_eq!(decoded["freq"], 1.0e6);
    }

    #[test]
    fn field_reads_mapping_keys_and_rejects_non_mappings() {
        let v = json!({"a": 1, "b": "two"});
        assert_eq!(v.field("a"), Some(&json!(1)));
        assert_eq!(v.field_as::<i64>("a"), Some(1));
        assert_eq!(v.field("missing"), None);

        let scalar = json!(42);
        assert_eq!(scalar.field("a"), None);
    }
}
