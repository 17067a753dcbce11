//! Type-preserving XML representation of structured payloads.
//!
//! ```text
//! <object><member name="id"><number>7</number></member></object>
//! ```
//!
//! Every value is one of `object`, `array`, `string`, `number`, `boolean`
//! or `null`, so a document decodes back to exactly the value it was
//! encoded from.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Number, Value};

use crate::errors::{BtpError, Result};

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| BtpError::Encode(e.to_string()))
}

fn write_scalar(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(tag)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesEnd::new(tag)))
}

fn write_value(writer: &mut Writer<Vec<u8>>, value: &Value) -> Result<()> {
    match value {
        Value::Null => write(writer, Event::Empty(BytesStart::new("null"))),
        Value::Bool(b) => write_scalar(writer, "boolean", if *b { "true" } else { "false" }),
        Value::Number(n) => write_scalar(writer, "number", &n.to_string()),
        Value::String(s) => write_scalar(writer, "string", s),
        Value::Array(items) => {
            write(writer, Event::Start(BytesStart::new("array")))?;
            for item in items {
                write_value(writer, item)?;
            }
            write(writer, Event::End(BytesEnd::new("array")))
        }
        Value::Object(map) => {
            write(writer, Event::Start(BytesStart::new("object")))?;
            for (key, member) in map {
                let mut start = BytesStart::new("member");
                start.push_attribute(("name", key.as_str()));
                write(writer, Event::Start(start))?;
                write_value(writer, member)?;
                write(writer, Event::End(BytesEnd::new("member")))?;
            }
            write(writer, Event::End(BytesEnd::new("object")))
        }
    }
}

/// Encode a value as an XML document.
pub fn xml_encode(value: &Value) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    write(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    write_value(&mut writer, value)?;
    Ok(writer.into_inner())
}

fn malformed(message: impl Into<String>) -> BtpError {
    BtpError::Malformed(message.into())
}

fn xml_error(e: impl std::fmt::Display) -> BtpError {
    BtpError::Malformed(format!("invalid xml: {e}"))
}

/// Next event that carries structure: skips the declaration, comments,
/// processing instructions and whitespace between elements.
fn next_event<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Event<'a>> {
    loop {
        let event = reader.read_event().map_err(xml_error)?;
        match event {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => continue,
            Event::Text(ref text) if text.iter().all(|b| b.is_ascii_whitespace()) => continue,
            other => return Ok(other),
        }
    }
}

fn read_text(reader: &mut Reader<&[u8]>, tag: &str) -> Result<String> {
    let mut text = String::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Text(t) => text.push_str(&t.unescape().map_err(xml_error)?),
            Event::CData(c) => text.push_str(
                std::str::from_utf8(&c.into_inner()).map_err(|e| malformed(e.to_string()))?,
            ),
            Event::End(end) if end.name().as_ref() == tag.as_bytes() => return Ok(text),
            Event::Eof => return Err(malformed(format!("unterminated <{tag}>"))),
            Event::Comment(_) => {}
            _ => return Err(malformed(format!("unexpected markup inside <{tag}>"))),
        }
    }
}

fn parse_number(text: &str) -> Result<Number> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Ok(n.into());
    }
    if let Ok(n) = text.parse::<u64>() {
        return Ok(n.into());
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| malformed(format!("invalid number '{text}'")))
}

/// Deepest `array`/`object` nesting accepted on decode.
pub const MAX_XML_DEPTH: usize = 128;

fn parse_element(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    empty: bool,
    depth: usize,
) -> Result<Value> {
    if depth > MAX_XML_DEPTH {
        return Err(malformed(format!(
            "xml nesting deeper than {MAX_XML_DEPTH} levels"
        )));
    }
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    match name.as_str() {
        "null" => {
            if !empty {
                read_text(reader, "null")?;
            }
            Ok(Value::Null)
        }
        "string" => Ok(Value::String(if empty {
            String::new()
        } else {
            read_text(reader, "string")?
        })),
        "number" => {
            let text = if empty { String::new() } else { read_text(reader, "number")? };
            Ok(Value::Number(parse_number(&text)?))
        }
        "boolean" => {
            let text = if empty { String::new() } else { read_text(reader, "boolean")? };
            match text.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(malformed(format!("invalid boolean '{other}'"))),
            }
        }
        "array" => {
            let mut items = Vec::new();
            if empty {
                return Ok(Value::Array(items));
            }
            loop {
                match next_event(reader)? {
                    Event::Start(e) => items.push(parse_element(reader, &e, false, depth + 1)?),
                    Event::Empty(e) => items.push(parse_element(reader, &e, true, depth + 1)?),
                    Event::End(_) => return Ok(Value::Array(items)),
                    Event::Eof => return Err(malformed("unterminated <array>")),
                    _ => return Err(malformed("unexpected text inside <array>")),
                }
            }
        }
        "object" => {
            let mut map = Map::new();
            if empty {
                return Ok(Value::Object(map));
            }
            loop {
                match next_event(reader)? {
                    Event::Start(member) if member.name().as_ref() == b"member" => {
                        let key = member_name(&member)?;
                        let value = match next_event(reader)? {
                            Event::Start(e) => parse_element(reader, &e, false, depth + 1)?,
                            Event::Empty(e) => parse_element(reader, &e, true, depth + 1)?,
                            _ => return Err(malformed(format!("member '{key}' has no value"))),
                        };
                        match next_event(reader)? {
                            Event::End(end) if end.name().as_ref() == b"member" => {}
                            _ => return Err(malformed(format!("member '{key}' not closed"))),
                        }
                        map.insert(key, value);
                    }
                    Event::Empty(member) if member.name().as_ref() == b"member" => {
                        map.insert(member_name(&member)?, Value::Null);
                    }
                    Event::End(_) => return Ok(Value::Object(map)),
                    Event::Eof => return Err(malformed("unterminated <object>")),
                    _ => return Err(malformed("unexpected content inside <object>")),
                }
            }
        }
        other => Err(malformed(format!("unknown element <{other}>"))),
    }
}

fn member_name(member: &BytesStart<'_>) -> Result<String> {
    let attr = member
        .try_get_attribute("name")
        .map_err(xml_error)?
        .ok_or_else(|| malformed("member without a name"))?;
    Ok(attr.unescape_value().map_err(xml_error)?.into_owned())
}

/// Decode an XML document produced by [`xml_encode`].
pub fn xml_decode(bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes).map_err(|e| malformed(e.to_string()))?;
    let mut reader = Reader::from_str(text);
    let value = match next_event(&mut reader)? {
        Event::Start(e) => parse_element(&mut reader, &e, false, 1)?,
        Event::Empty(e) => parse_element(&mut reader, &e, true, 1)?,
        Event::Eof => return Err(malformed("empty xml document")),
        _ => return Err(malformed("xml document has no root element")),
    };
    match next_event(&mut reader)? {
        Event::Eof => Ok(value),
        _ => Err(malformed("trailing content after xml root element")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_preserves_types() {
        let value = json!({
            "id": 7,
            "price": 1.5,
            "title": "Tom & Jerry <live>",
            "free": false,
            "tags": ["a", "", null],
            "owner": {"userId": 900}
        });
        let encoded = xml_encode(&value).unwrap();
        assert_eq!(xml_decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_encoding_shape() {
        let encoded = String::from_utf8(xml_encode(&json!({"id": 7})).unwrap()).unwrap();
        assert!(encoded.ends_with(
            r#"<object><member name="id"><number>7</number></member></object>"#
        ));
    }

    #[test]
    fn test_tolerates_whitespace() {
        let doc = b"<?xml version=\"1.0\"?>\n<object>\n  <member name=\"a\">\n    <string>x</string>\n  </member>\n</object>\n";
        assert_eq!(xml_decode(doc).unwrap(), json!({"a": "x"}));
    }

    #[test]
    fn test_rejects_unknown_elements() {
        assert!(matches!(
            xml_decode(b"<html></html>"),
            Err(BtpError::Malformed(_))
        ));
        assert!(xml_decode(b"<number>abc</number>").is_err());
        assert!(xml_decode(b"").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let depth = 200_000;
        let doc = format!("{}{}", "<array>".repeat(depth), "</array>".repeat(depth));
        assert!(matches!(
            xml_decode(doc.as_bytes()),
            Err(BtpError::Malformed(msg)) if msg.contains("nesting")
        ));
    }

    #[test]
    fn test_nesting_at_limit_decodes() {
        let doc = format!(
            "{}{}",
            "<array>".repeat(MAX_XML_DEPTH),
            "</array>".repeat(MAX_XML_DEPTH)
        );
        let mut value = xml_decode(doc.as_bytes()).unwrap();
        for _ in 1..MAX_XML_DEPTH {
            value = value.as_array().unwrap()[0].clone();
        }
        assert_eq!(value, Value::Array(Vec::new()));
    }
}
