use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Rebuilds `value` with object keys in lexicographic order at every depth.
/// Array order is significant and kept as-is.
pub fn canonicalize_json_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(canonicalize_json_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            let mut out = serde_json::Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonicalize_json_value(&map[key]));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn canonical_json_string(value: &serde_json::Value) -> String {
    serde_json::to_string(&canonicalize_json_value(value)).unwrap_or_else(|_| "null".to_string())
}

/// Hash stored next to every audit record so a later reader can detect
/// a `details` payload that no longer matches what was written.
pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json_string(value).as_bytes())
}
