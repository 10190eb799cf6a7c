use std::{
    collections::BTreeMap,
    fmt::{Display, Error, Formatter},
    str::FromStr,
};

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha3::{Digest, Sha3_256};

pub const HASH_SIZE: usize = 32; // 32 bytes / 256 bits

/// A 256-bit content fingerprint, rendered as lowercase hex on the wire.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub const fn zero() -> Self {
        Hash::new([0; HASH_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Hash {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| "Invalid hex string")?;
        let bytes: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| "Invalid hash")?;
        Ok(Hash::new(bytes))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", &self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Hash::from_str(&hex).map_err(SerdeError::custom)
    }
}

/// SHA3-256 of a byte slice.
#[inline]
pub fn sha3_256(value: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(value);
    let result: [u8; HASH_SIZE] = hasher.finalize().into();
    Hash(result)
}

// Rebuild the value with object keys sorted at every level so the rendered
// form does not depend on the parser's map ordering.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Render a JSON value in its canonical form: object keys sorted, no
/// insignificant whitespace. Equal values always render to equal strings.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Deterministic fingerprint of a JSON document, used for change detection.
pub fn content_hash(value: &Value) -> Hash {
    sha3_256(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha3_256_empty_vector() {
        // NIST test vector for SHA3-256("")
        let digest = sha3_256(b"");
        assert_eq!(
            digest.to_hex(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let digest = sha3_256(b"agreement");
        let parsed: Hash = digest.to_hex().parse().expect("parse hash");
        assert_eq!(digest, parsed);

        let value = serde_json::to_value(digest).expect("serialize hash");
        let back: Hash = serde_json::from_value(value).expect("deserialize hash");
        assert_eq!(digest, back);
    }

    #[test]
    fn test_canonical_json_is_key_order_independent() {
        let a = json!({"b": 1, "a": {"d": 2, "c": [1, 2, {"z": 0, "y": 1}]}});
        let b = json!({"a": {"c": [1, 2, {"y": 1, "z": 0}], "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_content_hash_detects_change() {
        let a = json!({"workloads": ["x"]});
        let b = json!({"workloads": ["x", "y"]});
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
