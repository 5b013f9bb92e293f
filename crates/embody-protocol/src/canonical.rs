//! Deterministic byte encodings used for signing.

use serde_json::Value;

/// Write a `u32` little-endian length prefix followed by the bytes.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn write_length_prefixed(data: &mut Vec<u8>, bytes: &[u8]) {
    // Envelopes are capped far below u32::MAX before they are signed or verified.
    data.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    data.extend_from_slice(bytes);
}

/// Canonical JSON: object keys sorted bytewise at every depth, no
/// insignificant whitespace. Scalars use `serde_json`'s compact form.
#[must_use]
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        },
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(Value::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        },
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let a = json!({"b": 1, "a": {"z": [1, {"y": true, "x": null}], "c": "s"}});
        assert_eq!(
            String::from_utf8(canonical_json(&a)).unwrap(),
            r#"{"a":{"c":"s","z":[1,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"q":2,"p":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "y" : {"p":3,"q":2}, "x" : 1 }"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_strings_are_escaped() {
        let v = json!({"k\"ey": "line\nbreak"});
        assert_eq!(
            String::from_utf8(canonical_json(&v)).unwrap(),
            r#"{"k\"ey":"line\nbreak"}"#
        );
    }

    #[test]
    fn test_length_prefix() {
        let mut data = Vec::new();
        write_length_prefixed(&mut data, b"abc");
        assert_eq!(data, vec![3, 0, 0, 0, b'a', b'b', b'c']);
    }
}
