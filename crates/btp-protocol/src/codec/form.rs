use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::errors::{BtpError, Result};

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Encode a flat object as `application/x-www-form-urlencoded`.
///
/// Array members become repeated keys. Nested objects cannot be expressed
/// and are rejected.
pub fn form_encode(value: &Value) -> Result<String> {
    let Value::Object(map) = value else {
        return Err(BtpError::Encode(
            "form content must be an object".to_string(),
        ));
    };

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, member) in map {
        match member {
            Value::Array(items) => {
                for item in items {
                    let text = scalar_text(item).ok_or_else(|| {
                        BtpError::Encode(format!("form field '{key}' is not a scalar array"))
                    })?;
                    serializer.append_pair(key, &text);
                }
            }
            other => {
                let text = scalar_text(other).ok_or_else(|| {
                    BtpError::Encode(format!("form field '{key}' is a nested object"))
                })?;
                serializer.append_pair(key, &text);
            }
        }
    }
    Ok(serializer.finish())
}

/// Decode form content into an object of strings.
///
/// A key that appears more than once decodes to an array of its values.
pub fn form_decode(bytes: &[u8]) -> Value {
    let mut map = Map::new();
    for (key, value) in form_urlencoded::parse(bytes) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.into_owned(), value);
            }
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_flat_object() {
        let encoded = form_encode(&json!({"name": "a b", "count": 3, "ok": true})).unwrap();
        assert_eq!(encoded, "count=3&name=a+b&ok=true");
    }

    #[test]
    fn test_arrays_repeat_keys() {
        let encoded = form_encode(&json!({"tag": ["x", "y"]})).unwrap();
        assert_eq!(encoded, "tag=x&tag=y");
        assert_eq!(form_decode(encoded.as_bytes()), json!({"tag": ["x", "y"]}));
    }

    #[test]
    fn test_nested_rejected() {
        assert!(form_encode(&json!({"inner": {"a": 1}})).is_err());
        assert!(form_encode(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_decode_percent_escapes() {
        assert_eq!(
            form_decode(b"q=caf%C3%A9&empty="),
            json!({"q": "café", "empty": ""})
        );
    }
}
