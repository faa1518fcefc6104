//! RFC 8785 (JCS) canonical JSON serialization.
//!
//! Signatures are computed over the canonical form of a record so that any
//! independent implementation can re-serialize the parsed record and arrive
//! at byte-identical input to the verifier. Canonicalization sorts object
//! members by their UTF-16 code unit sequence and emits no insignificant
//! whitespace. Number and string formatting delegate to `serde_json`, whose
//! shortest-round-trip float printing and escape rules match the RFC's
//! ECMAScript-derived requirements for the values this crate produces.

use serde_json::Value;

use crate::error::{ObscuraError, Result};

/// Serializes a JSON value into its canonical byte form.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Canonicalizes any serializable structure.
pub fn canonicalize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_value(value)?;
    to_canonical_bytes(&json)
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if n.as_f64().map(|f| !f.is_finite()).unwrap_or(false) {
                return Err(ObscuraError::serialization(
                    "non-finite number cannot be canonicalized",
                ));
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => {
            // serde_json escapes exactly the characters JCS requires and
            // nothing else.
            let escaped = serde_json::to_string(s)?;
            out.extend_from_slice(escaped.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| {
                let a16: Vec<u16> = a.encode_utf16().collect();
                let b16: Vec<u16> = b.encode_utf16().collect();
                a16.cmp(&b16)
            });
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let escaped = serde_json::to_string(key)?;
                out.extend_from_slice(escaped.as_bytes());
                out.push(b':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canonical_str(value: &Value) -> String {
        String::from_utf8(to_canonical_bytes(value).unwrap()).unwrap()
    }

    #[test]
    fn test_object_keys_sorted() {
        let value = json!({"zeta": 1, "alpha": 2, "mid": [3, {"b": 1, "a": 2}]});
        assert_eq!(
            canonical_str(&value),
            r#"{"alpha":2,"mid":[3,{"a":2,"b":1}],"zeta":1}"#
        );
    }

    #[test]
    fn test_no_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": {"c": null}});
        assert_eq!(canonical_str(&value), r#"{"a":[1,2,3],"b":{"c":null}}"#);
    }

    #[test]
    fn test_scalars() {
        assert_eq!(canonical_str(&json!(true)), "true");
        assert_eq!(canonical_str(&json!(null)), "null");
        assert_eq!(canonical_str(&json!(0.7)), "0.7");
        assert_eq!(canonical_str(&json!(42)), "42");
        assert_eq!(canonical_str(&json!("a\"b\\c\n")), r#""a\"b\\c\n""#);
    }

    #[test]
    fn test_deterministic_across_insertion_orders() {
        let mut a = serde_json::Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = serde_json::Map::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));
        assert_eq!(
            to_canonical_bytes(&Value::Object(a)).unwrap(),
            to_canonical_bytes(&Value::Object(b)).unwrap()
        );
    }

    #[test]
    fn test_utf16_key_ordering() {
        // Per the RFC's test vectors, keys sort by UTF-16 code units.
        let value = json!({"é": 1, "e": 2, "\u{20ac}": 3});
        let s = canonical_str(&value);
        let e = s.find("\"e\"").unwrap();
        let eacute = s.find("é").unwrap();
        let euro = s.find('\u{20ac}').unwrap();
        assert!(e < eacute);
        assert!(eacute < euro);
    }
}
