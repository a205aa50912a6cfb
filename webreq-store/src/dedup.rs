//! Natural-key hashes used to make insert-or-reuse lookups index-friendly:
//! an MD5 digest of the URL path, one of the query string, and one of a
//! canonical (sorted-key) JSON encoding of the header map — matching the
//! reference implementation's hashing so two requests differing only in
//! header key order still collide.

use serde_json::Value;

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

pub fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn header_hash(header: &Value) -> String {
    md5_hex(&canonical_json(header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_hash_is_stable_regardless_of_key_order() {
        let h1 = json!({"a": "1", "b": "2"});
        let h2 = json!({"b": "2", "a": "1"});
        assert_eq!(header_hash(&h1), header_hash(&h2));
    }

    #[test]
    fn md5_hex_differs_on_input() {
        assert_ne!(md5_hex("/a?x=1"), md5_hex("/a?x=2"));
    }
}
