//! Content types and structured payload codecs.
//!
//! Structured payloads are carried as [`serde_json::Value`] only while they
//! are being encoded or decoded; callers convert to and from their own typed
//! structures with [`to_value`] and [`from_value`].

mod form;
mod xml;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{BtpError, Result};

pub use form::{form_decode, form_encode};
pub use xml::{xml_decode, xml_encode};

/// A content type BTP can encode and decode structured payloads as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Json,
    Xml,
    Form,
}

impl ContentType {
    pub const JSON_MIME: &'static str = "application/json";
    pub const XML_MIME: &'static str = "text/xml";
    pub const FORM_MIME: &'static str = "application/x-www-form-urlencoded";

    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => Self::JSON_MIME,
            ContentType::Xml => Self::XML_MIME,
            ContentType::Form => Self::FORM_MIME,
        }
    }

    /// Parse a `Content-Type` header value.
    ///
    /// Parameters such as `; charset=utf-8` are ignored. Anything outside the
    /// supported set is an [`BtpError::UnsupportedContentType`].
    pub fn from_header(value: &str) -> Result<Self> {
        let media = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        [ContentType::Json, ContentType::Xml, ContentType::Form]
            .into_iter()
            .find(|ct| media == ct.mime())
            .ok_or_else(|| BtpError::UnsupportedContentType(value.to_string()))
    }

    /// Content type for a response, given the request's `Accept` header.
    ///
    /// `text/xml` anywhere in `Accept` selects XML; everything else is JSON.
    pub fn for_accept(accept: Option<&str>) -> Self {
        match accept {
            Some(accept) if accept.to_ascii_lowercase().contains(Self::XML_MIME) => {
                ContentType::Xml
            }
            _ => ContentType::Json,
        }
    }

    pub fn encode(self, value: &Value) -> Result<Vec<u8>> {
        match self {
            ContentType::Json => {
                serde_json::to_vec(value).map_err(|e| BtpError::Encode(e.to_string()))
            }
            ContentType::Xml => xml_encode(value),
            ContentType::Form => form_encode(value).map(String::into_bytes),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<Value> {
        match self {
            ContentType::Json => {
                serde_json::from_slice(bytes).map_err(|e| BtpError::Malformed(e.to_string()))
            }
            ContentType::Xml => xml_decode(bytes),
            ContentType::Form => Ok(form_decode(bytes)),
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime())
    }
}

/// Convert a typed value into the wire-level representation.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BtpError::Encode(e.to_string()))
}

/// Convert a decoded payload into a typed structure, checking its shape.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BtpError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_from_header_media_type() {
        assert_eq!(
            ContentType::from_header("application/json; charset=utf-8").unwrap(),
            ContentType::Json
        );
        assert_eq!(ContentType::from_header("Text/XML").unwrap(), ContentType::Xml);
        assert_eq!(
            ContentType::from_header("application/x-www-form-urlencoded").unwrap(),
            ContentType::Form
        );
        assert!(matches!(
            ContentType::from_header("image/png"),
            Err(BtpError::UnsupportedContentType(ct)) if ct == "image/png"
        ));
    }

    #[test]
    fn test_from_header_rejects_longer_media_types() {
        assert_eq!(
            ContentType::from_header(" text/xml ;charset=UTF-8").unwrap(),
            ContentType::Xml
        );
        for value in ["application/jsonx", "text/xmlfoo", "application/json-seq; x=1", ""] {
            assert!(
                matches!(
                    ContentType::from_header(value),
                    Err(BtpError::UnsupportedContentType(_))
                ),
                "{value} should be unsupported"
            );
        }
    }

    #[test]
    fn test_for_accept() {
        assert_eq!(ContentType::for_accept(Some("text/xml")), ContentType::Xml);
        assert_eq!(
            ContentType::for_accept(Some("application/json, text/xml;q=0.5")),
            ContentType::Xml
        );
        assert_eq!(ContentType::for_accept(Some("text/html")), ContentType::Json);
        assert_eq!(ContentType::for_accept(None), ContentType::Json);
    }

    #[test]
    fn test_json_decode_rejects_garbage() {
        assert!(matches!(
            ContentType::Json.decode(b"{not json"),
            Err(BtpError::Malformed(_))
        ));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ware {
        id: u64,
        title: String,
    }

    #[test]
    fn test_typed_conversion_checks_shape() {
        let ware = Ware {
            id: 12,
            title: "Song".into(),
        };
        let value = to_value(&ware).unwrap();
        let back: Ware = from_value(value).unwrap();
        assert_eq!(back, ware);

        let wrong: Result<Ware> = from_value(json!({"id": "twelve"}));
        assert!(matches!(wrong, Err(BtpError::Malformed(_))));
    }
}
