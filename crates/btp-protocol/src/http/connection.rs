//! One HTTP/1.1 connection: head and body framing over any async stream.
//!
//! Every read and write is bounded by the connection's timeouts and, when
//! throttlers are attached, by their bandwidth budget.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use super::header::{HeaderFields, HttpHeader, MAX_LINE_LENGTH};
use super::throttle::BandwidthThrottler;
use crate::errors::{BtpError, Result};

/// Default timeout for connection reads and writes.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Blank lines tolerated before a start line.
pub const MAX_LEADING_BLANK_LINES: usize = 8;

/// Largest body slice moved per read or write.
pub const BODY_BUFFER_SIZE: usize = 16 * 1024;

/// Any bidirectional byte stream a connection can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(BtpError::from),
        Err(_) => Err(BtpError::Timeout),
    }
}

// ============================================================================
// Body framing
// ============================================================================

/// How the length of a body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    /// Framing of a request body.
    pub fn for_request(header: &HttpHeader) -> Self {
        if header.is_chunked() {
            BodyFraming::Chunked
        } else {
            match header.content_length() {
                Some(0) | None => BodyFraming::None,
                Some(n) => BodyFraming::Length(n),
            }
        }
    }

    /// Framing of a response body to a request made with `request_method`.
    pub fn for_response(header: &HttpHeader, request_method: &str) -> Self {
        if !header.response_may_have_body(request_method) {
            BodyFraming::None
        } else if header.is_chunked() {
            BodyFraming::Chunked
        } else {
            match header.content_length() {
                Some(0) => BodyFraming::None,
                Some(n) => BodyFraming::Length(n),
                None => BodyFraming::UntilClose,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    Done,
}

/// Progress through one received body.
#[derive(Debug)]
pub struct BodyReader {
    framing: BodyFraming,
    remaining: u64,
    chunk: ChunkState,
    trailer: HeaderFields,
    received: u64,
}

impl BodyReader {
    pub fn new(framing: BodyFraming) -> Self {
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            _ => 0,
        };
        Self {
            framing,
            remaining,
            chunk: ChunkState::Size,
            trailer: HeaderFields::new(),
            received: 0,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Trailer fields, available once the body has been read to the end.
    pub fn trailer(&self) -> &HeaderFields {
        &self.trailer
    }

    /// Body bytes received so far, as framed on the wire.
    pub fn received(&self) -> u64 {
        self.received
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A connection carrying HTTP/1.1 messages.
pub struct HttpConnection {
    stream: BufReader<Box<dyn IoStream>>,
    secure: bool,
    peer_addr: Option<SocketAddr>,
    read_timeout: Duration,
    write_timeout: Duration,
    read_throttler: Option<Arc<BandwidthThrottler>>,
    write_throttler: Option<Arc<BandwidthThrottler>>,
    bytes_read: u64,
    bytes_written: u64,
}

impl HttpConnection {
    pub fn new(stream: impl IoStream + 'static, secure: bool) -> Self {
        Self {
            stream: BufReader::new(Box::new(stream)),
            secure,
            peer_addr: None,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            read_throttler: None,
            write_throttler: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Whether the connection is protected by TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn set_timeouts(&mut self, read: Duration, write: Duration) {
        self.read_timeout = read;
        self.write_timeout = write;
    }

    pub fn set_read_throttler(&mut self, throttler: Option<Arc<BandwidthThrottler>>) {
        self.read_throttler = throttler;
    }

    pub fn set_write_throttler(&mut self, throttler: Option<Arc<BandwidthThrottler>>) {
        self.write_throttler = throttler;
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    // ------------------------------------------------------------------
    // Raw I/O
    // ------------------------------------------------------------------

    /// Read one line without its terminator. `None` on end of stream.
    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = Vec::new();
        let limit = self.read_timeout;
        let read = timed(
            limit,
            (&mut self.stream)
                .take(MAX_LINE_LENGTH as u64 + 2)
                .read_until(b'\n', &mut line),
        )
        .await?;
        if read == 0 {
            return Ok(None);
        }
        self.bytes_read += read as u64;
        if line.last() != Some(&b'\n') {
            return Err(BtpError::Malformed("line too long or truncated".to_string()));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| BtpError::Malformed("header line is not valid UTF-8".to_string()))
    }

    async fn read_some(&mut self, max: usize) -> Result<Vec<u8>> {
        let want = match &self.read_throttler {
            Some(throttler) => throttler.request_bytes(max).await,
            None => max,
        };
        let mut buf = vec![0u8; want];
        let limit = self.read_timeout;
        let n = timed(limit, self.stream.read(&mut buf)).await?;
        buf.truncate(n);
        self.bytes_read += n as u64;
        Ok(buf)
    }

    /// Write all of `data`, honoring the write throttler.
    pub async fn write_raw(&mut self, mut data: &[u8]) -> Result<()> {
        let limit = self.write_timeout;
        while !data.is_empty() {
            let n = match &self.write_throttler {
                Some(throttler) => throttler.request_bytes(data.len()).await,
                None => data.len(),
            };
            timed(limit, self.stream.write_all(&data[..n])).await?;
            self.bytes_written += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        let limit = self.write_timeout;
        timed(limit, self.stream.flush()).await
    }

    /// Close the write side of the connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        let limit = self.write_timeout;
        timed(limit, self.stream.shutdown()).await
    }

    // ------------------------------------------------------------------
    // Heads
    // ------------------------------------------------------------------

    /// Receive a request or response head.
    ///
    /// Returns `None` when the peer closed the connection before sending
    /// anything, which is how an idle keep-alive connection ends.
    pub async fn receive_header(&mut self) -> Result<Option<HttpHeader>> {
        let mut blank_lines = 0;
        let start = loop {
            match self.read_line().await? {
                None => return Ok(None),
                Some(line) if line.is_empty() => {
                    blank_lines += 1;
                    if blank_lines > MAX_LEADING_BLANK_LINES {
                        return Err(BtpError::Malformed(
                            "too many blank lines before message head".to_string(),
                        ));
                    }
                }
                Some(line) => break line,
            }
        };
        let mut header = HttpHeader::parse_start_line(&start)?;
        loop {
            match self.read_line().await? {
                None => {
                    return Err(BtpError::Malformed(
                        "connection closed inside message head".to_string(),
                    ))
                }
                Some(line) if line.is_empty() => break,
                Some(line) => header.fields_mut().parse_line(&line)?,
            }
        }
        trace!(start_line = %header.start_line(), "Received HTTP head");
        Ok(Some(header))
    }

    pub async fn send_header(&mut self, header: &HttpHeader) -> Result<()> {
        trace!(start_line = %header.start_line(), "Sending HTTP head");
        self.write_raw(&header.to_bytes()).await
    }

    // ------------------------------------------------------------------
    // Bodies
    // ------------------------------------------------------------------

    /// Write one chunk of a chunked body. Empty data writes nothing, since a
    /// zero-length chunk would end the body.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut framed = Vec::with_capacity(data.len() + 12);
        framed.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        framed.extend_from_slice(data);
        framed.extend_from_slice(b"\r\n");
        self.write_raw(&framed).await
    }

    /// End a chunked body, sending `trailer` after the last chunk.
    pub async fn write_last_chunk(&mut self, trailer: &HeaderFields) -> Result<()> {
        let mut framed = b"0\r\n".to_vec();
        framed.extend_from_slice(&trailer.to_bytes());
        self.write_raw(&framed).await
    }

    /// Read the next piece of a body. `None` once the body is complete.
    pub async fn read_body(&mut self, body: &mut BodyReader) -> Result<Option<Vec<u8>>> {
        match body.framing {
            BodyFraming::None => Ok(None),
            BodyFraming::Length(_) => {
                if body.remaining == 0 {
                    return Ok(None);
                }
                let max = body.remaining.min(BODY_BUFFER_SIZE as u64) as usize;
                let data = self.read_some(max).await?;
                if data.is_empty() {
                    return Err(BtpError::Malformed(format!(
                        "connection closed with {} body bytes outstanding",
                        body.remaining
                    )));
                }
                body.remaining -= data.len() as u64;
                body.received += data.len() as u64;
                Ok(Some(data))
            }
            BodyFraming::UntilClose => {
                let data = self.read_some(BODY_BUFFER_SIZE).await?;
                if data.is_empty() {
                    return Ok(None);
                }
                body.received += data.len() as u64;
                Ok(Some(data))
            }
            BodyFraming::Chunked => self.read_chunked(body).await,
        }
    }

    async fn read_chunked(&mut self, body: &mut BodyReader) -> Result<Option<Vec<u8>>> {
        loop {
            match body.chunk {
                ChunkState::Done => return Ok(None),
                ChunkState::Size => {
                    let line = self.read_line().await?.ok_or_else(|| {
                        BtpError::Malformed("connection closed before chunk size".to_string())
                    })?;
                    let size_text = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_text, 16).map_err(|_| {
                        BtpError::Malformed(format!("invalid chunk size '{size_text}'"))
                    })?;
                    if size == 0 {
                        self.read_trailer(body).await?;
                        body.chunk = ChunkState::Done;
                        return Ok(None);
                    }
                    body.chunk = ChunkState::Data(size);
                }
                ChunkState::Data(remaining) => {
                    let max = remaining.min(BODY_BUFFER_SIZE as u64) as usize;
                    let data = self.read_some(max).await?;
                    if data.is_empty() {
                        return Err(BtpError::Malformed(
                            "connection closed inside chunk".to_string(),
                        ));
                    }
                    let left = remaining - data.len() as u64;
                    if left == 0 {
                        match self.read_line().await? {
                            Some(line) if line.is_empty() => {}
                            _ => {
                                return Err(BtpError::Malformed(
                                    "chunk not terminated by CRLF".to_string(),
                                ))
                            }
                        }
                        body.chunk = ChunkState::Size;
                    } else {
                        body.chunk = ChunkState::Data(left);
                    }
                    body.received += data.len() as u64;
                    return Ok(Some(data));
                }
            }
        }
    }

    async fn read_trailer(&mut self, body: &mut BodyReader) -> Result<()> {
        loop {
            match self.read_line().await? {
                None => return Ok(()),
                Some(line) if line.is_empty() => return Ok(()),
                Some(line) => body.trailer.parse_line(&line)?,
            }
        }
    }

    /// Read and discard the rest of a body.
    pub async fn skip_body(&mut self, body: &mut BodyReader) -> Result<u64> {
        let mut skipped = 0;
        while let Some(data) = self.read_body(body).await? {
            skipped += data.len() as u64;
        }
        Ok(skipped)
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("secure", &self.secure)
            .field("peer_addr", &self.peer_addr)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::names;

    fn pair() -> (HttpConnection, HttpConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (HttpConnection::new(a, false), HttpConnection::new(b, false))
    }

    #[tokio::test]
    async fn test_head_round_trip() {
        let (mut a, mut b) = pair();
        let mut header = HttpHeader::request("PUT", "/x");
        header.set(names::HOST, "h:1");
        header.set(names::CONTENT_LENGTH, "5");
        a.send_header(&header).await.unwrap();

        let received = b.receive_header().await.unwrap().unwrap();
        assert_eq!(received, header);
        assert_eq!(BodyFraming::for_request(&received), BodyFraming::Length(5));
    }

    #[tokio::test]
    async fn test_leading_blank_lines_are_capped() {
        let (mut a, mut b) = pair();
        a.write_raw(b"\r\n\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n").await.unwrap();
        let received = b.receive_header().await.unwrap().unwrap();
        assert_eq!(received.path(), Some("/"));

        let (mut a, mut b) = pair();
        let flood = "\r\n".repeat(MAX_LEADING_BLANK_LINES + 1);
        a.write_raw(flood.as_bytes()).await.unwrap();
        a.write_raw(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(matches!(
            b.receive_header().await,
            Err(BtpError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_chunked_body_with_trailer() {
        let (mut a, mut b) = pair();
        a.write_chunk(b"hello ").await.unwrap();
        a.write_chunk(b"").await.unwrap();
        a.write_chunk(b"world").await.unwrap();
        let mut trailer = HeaderFields::new();
        trailer.set(names::BTP_CONTENT_SIGNATURE, "abcd");
        a.write_last_chunk(&trailer).await.unwrap();

        let mut body = BodyReader::new(BodyFraming::Chunked);
        let mut data = Vec::new();
        while let Some(piece) = b.read_body(&mut body).await.unwrap() {
            data.extend(piece);
        }
        assert_eq!(data, b"hello world");
        assert_eq!(body.received(), 11);
        assert_eq!(body.trailer().get(names::BTP_CONTENT_SIGNATURE), Some("abcd"));
    }

    #[tokio::test]
    async fn test_length_body_truncated() {
        let (mut a, mut b) = pair();
        a.write_raw(b"abc").await.unwrap();
        drop(a);

        let mut body = BodyReader::new(BodyFraming::Length(10));
        assert_eq!(b.read_body(&mut body).await.unwrap().unwrap(), b"abc");
        assert!(matches!(
            b.read_body(&mut body).await,
            Err(BtpError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_a, mut b) = pair();
        b.set_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        assert!(matches!(b.receive_header().await, Err(BtpError::Timeout)));
    }

    #[tokio::test]
    async fn test_closed_before_head() {
        let (a, mut b) = pair();
        drop(a);
        assert!(b.receive_header().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_chunk_size() {
        let (mut a, mut b) = pair();
        a.write_raw(b"zz\r\n").await.unwrap();
        let mut body = BodyReader::new(BodyFraming::Chunked);
        assert!(b.read_body(&mut body).await.is_err());
    }
}
