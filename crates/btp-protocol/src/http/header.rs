//! HTTP/1.1 message heads and trailers.
//!
//! Heads are kept as an ordered list of fields so that a message is written
//! exactly as it was built, and the start line is reproduced byte-for-byte
//! for header signatures.

use http::StatusCode;

use crate::errors::{BtpError, Result};

/// Header and trailer field names used by BTP.
pub mod names {
    pub const BTP_VERSION: &str = "Btp-Version";
    pub const BTP_USER_ID: &str = "Btp-User-Id";
    pub const BTP_AGENT_USER_ID: &str = "Btp-Agent-User-Id";
    pub const BTP_AGENT_PROFILE_ID: &str = "Btp-Agent-Profile-Id";
    pub const BTP_HEADER_SIGNATURE: &str = "Btp-Header-Signature";
    pub const BTP_CONTENT_SIGNATURE: &str = "Btp-Content-Signature";

    pub const ACCEPT: &str = "Accept";
    pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
    pub const ALLOW: &str = "Allow";
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const HOST: &str = "Host";
    pub const LOCATION: &str = "Location";
    pub const SERVER: &str = "Server";
    pub const TE: &str = "TE";
    pub const TRAILER: &str = "Trailer";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const USER_AGENT: &str = "User-Agent";
    pub const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
}

/// Longest start line or field line accepted from a peer.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Most fields accepted in one head or trailer.
pub const MAX_FIELDS: usize = 128;

// ============================================================================
// Fields
// ============================================================================

/// Ordered, case-insensitive list of header or trailer fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: Vec<(String, String)>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name` to a single value, replacing earlier values in place.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(first) => {
                self.fields[first].1 = value;
                let mut index = 0;
                self.fields.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Append another value for `name`.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.fields.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse one `Name: value` line.
    pub fn parse_line(&mut self, line: &str) -> Result<()> {
        if self.fields.len() >= MAX_FIELDS {
            return Err(BtpError::Malformed("too many header fields".to_string()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| BtpError::Malformed(format!("invalid header field '{line}'")))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(BtpError::Malformed(format!("invalid header name '{name}'")));
        }
        self.add(name, value.trim());
        Ok(())
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Serialized fields followed by the blank line that ends a head or trailer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

// ============================================================================
// Start line
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.1" => Ok(HttpVersion::Http11),
            "HTTP/1.0" => Ok(HttpVersion::Http10),
            other => Err(BtpError::Malformed(format!("unsupported HTTP version '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartLine {
    Request {
        method: String,
        path: String,
        version: HttpVersion,
    },
    Response {
        version: HttpVersion,
        status: u16,
        reason: String,
    },
}

/// Reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

// ============================================================================
// Head
// ============================================================================

/// The head of a request or response: start line plus fields.
#[derive(Debug, Clone)]
pub struct HttpHeader {
    start: StartLine,
    /// Start line as received, kept until the start line is changed.
    received_start: Option<String>,
    fields: HeaderFields,
}

impl PartialEq for HttpHeader {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.fields == other.fields
    }
}

impl Eq for HttpHeader {}

impl HttpHeader {
    /// A new HTTP/1.1 request head.
    pub fn request(method: &str, path: &str) -> Self {
        Self {
            start: StartLine::Request {
                method: method.to_string(),
                path: path.to_string(),
                version: HttpVersion::Http11,
            },
            received_start: None,
            fields: HeaderFields::new(),
        }
    }

    /// A new HTTP/1.1 response head with the canonical reason phrase.
    pub fn response(status: u16) -> Self {
        Self {
            start: StartLine::Response {
                version: HttpVersion::Http11,
                status,
                reason: reason_phrase(status).to_string(),
            },
            received_start: None,
            fields: HeaderFields::new(),
        }
    }

    /// Parse a start line received from a peer.
    pub fn parse_start_line(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        let third = parts.next();

        let start = if first.starts_with("HTTP/") {
            let version = HttpVersion::parse(first)?;
            let status = second
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|s| (100..1000).contains(s))
                .ok_or_else(|| BtpError::Malformed(format!("invalid status line '{line}'")))?;
            StartLine::Response {
                version,
                status,
                reason: third.unwrap_or_default().to_string(),
            }
        } else {
            match (second, third) {
                (Some(path), Some(version)) if !first.is_empty() && !path.is_empty() => {
                    StartLine::Request {
                        method: first.to_string(),
                        path: path.to_string(),
                        version: HttpVersion::parse(version)?,
                    }
                }
                _ => {
                    return Err(BtpError::Malformed(format!("invalid request line '{line}'")));
                }
            }
        };
        Ok(Self {
            start,
            received_start: Some(line.to_string()),
            fields: HeaderFields::new(),
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// The start line exactly as it is written on the wire, without CRLF.
    ///
    /// A received head reports its start line byte for byte, so signatures
    /// over it match what the peer signed.
    pub fn start_line(&self) -> String {
        if let Some(received) = &self.received_start {
            return received.clone();
        }
        match &self.start {
            StartLine::Request {
                method,
                path,
                version,
            } => format!("{method} {path} {}", version.as_str()),
            StartLine::Response {
                version,
                status,
                reason,
            } => format!("{} {status} {reason}", version.as_str()),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// Request target (path plus query).
    pub fn path(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { path, .. } => Some(path),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn version(&self) -> HttpVersion {
        match &self.start {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => *version,
        }
    }

    pub fn set_version(&mut self, new_version: HttpVersion) {
        match &mut self.start {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => {
                *version = new_version
            }
        }
        self.received_start = None;
    }

    /// Change the status of a response head, resetting its reason phrase.
    pub fn set_status(&mut self, new_status: u16) {
        if let StartLine::Response { status, reason, .. } = &mut self.start {
            *status = new_status;
            *reason = reason_phrase(new_status).to_string();
        }
        self.received_start = None;
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut HeaderFields {
        &mut self.fields
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.fields.set(name, value);
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.fields.add(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.remove(name);
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get(names::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.fields
            .get_all(names::TRANSFER_ENCODING)
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether a response to a request with `request_method` can carry a body.
    pub fn response_may_have_body(&self, request_method: &str) -> bool {
        match self.status() {
            Some(status) => {
                !(request_method.eq_ignore_ascii_case("HEAD")
                    || (100..200).contains(&status)
                    || status == 204
                    || status == 304)
            }
            None => false,
        }
    }

    /// Serialized head including the terminating blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.start_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        self.fields.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let mut header = HttpHeader::request("GET", "/api/3.0/wares?x=1");
        header.set(names::HOST, "node.example:19100");
        header.add("X-Tag", "a");
        header.add("X-Tag", "b");
        assert_eq!(
            String::from_utf8(header.to_bytes()).unwrap(),
            "GET /api/3.0/wares?x=1 HTTP/1.1\r\nHost: node.example:19100\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n"
        );
    }

    #[test]
    fn test_response_start_line() {
        let mut header = HttpHeader::response(404);
        assert_eq!(header.start_line(), "HTTP/1.1 404 Not Found");
        header.set_status(201);
        assert_eq!(header.start_line(), "HTTP/1.1 201 Created");
    }

    #[test]
    fn test_received_start_line_is_kept_verbatim() {
        let bare = HttpHeader::parse_start_line("HTTP/1.1 200").unwrap();
        assert_eq!(bare.status(), Some(200));
        assert_eq!(bare.reason(), Some(""));
        assert_eq!(bare.start_line(), "HTTP/1.1 200");

        let odd = HttpHeader::parse_start_line("HTTP/1.1 200 Fine Thanks").unwrap();
        assert_eq!(odd.start_line(), "HTTP/1.1 200 Fine Thanks");

        let mut changed = odd.clone();
        changed.set_status(404);
        assert_eq!(changed.start_line(), "HTTP/1.1 404 Not Found");
    }

    #[test]
    fn test_parse_start_lines() {
        let req = HttpHeader::parse_start_line("POST /a/b HTTP/1.1").unwrap();
        assert_eq!(req.method(), Some("POST"));
        assert_eq!(req.path(), Some("/a/b"));

        let resp = HttpHeader::parse_start_line("HTTP/1.1 500 Internal Server Error").unwrap();
        assert_eq!(resp.status(), Some(500));
        assert_eq!(resp.reason(), Some("Internal Server Error"));
        assert_eq!(resp.start_line(), "HTTP/1.1 500 Internal Server Error");

        assert!(HttpHeader::parse_start_line("GET /").is_err());
        assert!(HttpHeader::parse_start_line("").is_err());
        assert!(HttpHeader::parse_start_line("HTTP/1.1 abc").is_err());
        assert!(HttpHeader::parse_start_line("GET / HTTP/2").is_err());
    }

    #[test]
    fn test_set_replaces_all_values() {
        let mut fields = HeaderFields::new();
        fields.add("Accept", "a");
        fields.add("Host", "h");
        fields.add("accept", "b");
        fields.set("ACCEPT", "c");
        let all: Vec<_> = fields.iter().collect();
        assert_eq!(all, vec![("Accept", "c"), ("Host", "h")]);
    }

    #[test]
    fn test_parse_field_line() {
        let mut fields = HeaderFields::new();
        fields.parse_line("Btp-User-Id:  42 ").unwrap();
        assert_eq!(fields.get("btp-user-id"), Some("42"));
        assert!(fields.parse_line("no colon here").is_err());
        assert!(fields.parse_line("Bad Name: x").is_err());
    }

    #[test]
    fn test_body_indicators() {
        let mut header = HttpHeader::response(200);
        header.set(names::TRANSFER_ENCODING, "chunked");
        assert!(header.is_chunked());
        assert!(header.response_may_have_body("GET"));
        assert!(!header.response_may_have_body("HEAD"));

        header.set_status(204);
        assert!(!header.response_may_have_body("GET"));
    }
}
