//! Content-encoding negotiation and streaming (de)compression.
//!
//! Compressors sit between the signature and the wire: a sender signs the
//! logical bytes and then compresses them, a receiver decompresses and then
//! verifies. Compression therefore never affects signature validity.

use std::io::Write;

use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;

/// User agents whose "deflate" handling cannot be trusted.
const GZIP_ONLY_AGENTS: &[&str] = &["msie", "webkit", "konqueror"];

/// A `Content-Encoding` BTP knows how to produce and consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    /// zlib-wrapped deflate, as HTTP defines "deflate".
    Deflate,
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Gzip => "gzip",
        }
    }

    /// Parse a `Content-Encoding` value. `identity` and unknown codings give `None`.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deflate" => Some(ContentEncoding::Deflate),
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            _ => None,
        }
    }

    /// Choose a response encoding from the request's `User-Agent` and
    /// `Accept-Encoding`.
    ///
    /// Clients without a user agent, or whose agent belongs to a family
    /// listed in [`GZIP_ONLY_AGENTS`], only ever get gzip. Everyone else gets
    /// deflate when they accept it, then gzip. No match means no compression.
    pub fn negotiate(user_agent: Option<&str>, accept_encoding: Option<&str>) -> Option<Self> {
        let accept = accept_encoding?.to_ascii_lowercase();
        let must_gzip = match user_agent {
            None => true,
            Some(agent) => {
                let agent = agent.to_ascii_lowercase();
                GZIP_ONLY_AGENTS.iter().any(|token| agent.contains(token))
            }
        };

        if !must_gzip && accept.contains("deflate") {
            Some(ContentEncoding::Deflate)
        } else if accept.contains("gzip") {
            Some(ContentEncoding::Gzip)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum CompressorInner {
    Deflate(ZlibEncoder<Vec<u8>>),
    Gzip(GzEncoder<Vec<u8>>),
}

/// Incremental compressor: feed plain bytes, collect compressed output.
pub struct Compressor {
    inner: CompressorInner,
}

impl Compressor {
    pub fn new(encoding: ContentEncoding) -> Self {
        let inner = match encoding {
            ContentEncoding::Deflate => {
                CompressorInner::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
            }
            ContentEncoding::Gzip => {
                CompressorInner::Gzip(GzEncoder::new(Vec::new(), Compression::default()))
            }
        };
        Self { inner }
    }

    /// Compress `data`, returning whatever output is ready so far.
    pub fn update(&mut self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match &mut self.inner {
            CompressorInner::Deflate(e) => {
                e.write_all(data)?;
                Ok(std::mem::take(e.get_mut()))
            }
            CompressorInner::Gzip(e) => {
                e.write_all(data)?;
                Ok(std::mem::take(e.get_mut()))
            }
        }
    }

    /// Flush the remaining output, including the stream footer.
    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        match self.inner {
            CompressorInner::Deflate(e) => e.finish(),
            CompressorInner::Gzip(e) => e.finish(),
        }
    }
}

enum DecompressorInner {
    Deflate(ZlibDecoder<Vec<u8>>),
    Gzip(GzDecoder<Vec<u8>>),
}

/// Incremental decompressor: feed wire bytes, collect plain output.
pub struct Decompressor {
    inner: DecompressorInner,
}

impl Decompressor {
    pub fn new(encoding: ContentEncoding) -> Self {
        let inner = match encoding {
            ContentEncoding::Deflate => DecompressorInner::Deflate(ZlibDecoder::new(Vec::new())),
            ContentEncoding::Gzip => DecompressorInner::Gzip(GzDecoder::new(Vec::new())),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match &mut self.inner {
            DecompressorInner::Deflate(d) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
            DecompressorInner::Gzip(d) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
        }
    }

    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        match self.inner {
            DecompressorInner::Deflate(d) => d.finish(),
            DecompressorInner::Gzip(d) => d.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(encoding: ContentEncoding, data: &[u8]) -> Vec<u8> {
        let mut compressor = Compressor::new(encoding);
        let mut wire = Vec::new();
        for chunk in data.chunks(7) {
            wire.extend(compressor.update(chunk).unwrap());
        }
        wire.extend(compressor.finish().unwrap());

        let mut decompressor = Decompressor::new(encoding);
        let mut plain = Vec::new();
        for chunk in wire.chunks(5) {
            plain.extend(decompressor.update(chunk).unwrap());
        }
        plain.extend(decompressor.finish().unwrap());
        plain
    }

    #[test]
    fn test_streaming_round_trip() {
        let data: Vec<u8> = b"bitmunk ".iter().cycle().take(4096).copied().collect();
        assert_eq!(round_trip(ContentEncoding::Deflate, &data), data);
        assert_eq!(round_trip(ContentEncoding::Gzip, &data), data);
    }

    #[test]
    fn test_negotiation() {
        let curl = Some("curl/8.0");
        assert_eq!(
            ContentEncoding::negotiate(curl, Some("gzip, deflate")),
            Some(ContentEncoding::Deflate)
        );
        assert_eq!(
            ContentEncoding::negotiate(curl, Some("gzip")),
            Some(ContentEncoding::Gzip)
        );
        assert_eq!(ContentEncoding::negotiate(curl, Some("br")), None);
        assert_eq!(ContentEncoding::negotiate(curl, None), None);
    }

    #[test]
    fn test_browser_engines_get_gzip() {
        let safari = Some("Mozilla/5.0 AppleWebKit/605.1.15 Safari/605.1.15");
        assert_eq!(
            ContentEncoding::negotiate(safari, Some("deflate, gzip")),
            Some(ContentEncoding::Gzip)
        );
        assert_eq!(ContentEncoding::negotiate(safari, Some("deflate")), None);
        assert_eq!(
            ContentEncoding::negotiate(None, Some("deflate, gzip")),
            Some(ContentEncoding::Gzip)
        );
    }

    #[test]
    fn test_header_parse() {
        assert_eq!(ContentEncoding::from_header("GZIP"), Some(ContentEncoding::Gzip));
        assert_eq!(ContentEncoding::from_header("identity"), None);
    }
}
