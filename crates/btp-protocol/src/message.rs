//! The BTP message envelope.
//!
//! A [`BtpMessage`] describes one direction of an exchange. On the way out
//! it adds the `Btp-*` security fields, signs the head and streams the body
//! through a content signature and an optional compressor. On the way in it
//! checks the head against the attached key resolver, decompresses the body
//! and checks the content signature.
//!
//! Security status only ever moves forward: `Unchecked` may become `Secure`
//! or `Breach`, `Secure` may become `Breach`, and `Breach` is final.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use btp_crypto::{verify_signature, DigitalSignature, Profile, ProfileId, UserId};

use crate::codec::{self, ContentType};
use crate::encoding::{Compressor, ContentEncoding, Decompressor};
use crate::errors::{BreachKind, BtpError, ErrorPayload, Result};
use crate::http::connection::BODY_BUFFER_SIZE;
use crate::http::{names, BodyFraming, BodyReader, HttpConnection, HttpHeader};
use crate::keys::KeyResolver;
use crate::trailer::SignedTrailer;

/// The only protocol version spoken.
pub const BTP_VERSION: &str = "1.0";

/// Largest structured payload buffered for decoding.
pub const MAX_STRUCTURED_CONTENT: usize = 16 * 1024 * 1024;

// ============================================================================
// Kinds and status
// ============================================================================

/// Request method of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    Get,
    Put,
    Post,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Get => "GET",
            MessageKind::Put => "PUT",
            MessageKind::Post => "POST",
            MessageKind::Delete => "DELETE",
            MessageKind::Head => "HEAD",
            MessageKind::Options => "OPTIONS",
            MessageKind::Trace => "TRACE",
            MessageKind::Connect => "CONNECT",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        let kind = match method {
            "GET" => MessageKind::Get,
            "PUT" => MessageKind::Put,
            "POST" => MessageKind::Post,
            "DELETE" => MessageKind::Delete,
            "HEAD" => MessageKind::Head,
            "OPTIONS" => MessageKind::Options,
            "TRACE" => MessageKind::Trace,
            "CONNECT" => MessageKind::Connect,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the security checks run on a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStatus {
    /// No check was possible: no key resolver was attached.
    Unchecked,
    Secure,
    Breach,
}

/// Bytes covered by a header signature: the start line followed directly by
/// the Host value.
pub fn header_signature_bytes(start_line: &str, host: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(start_line.len() + host.len());
    bytes.extend_from_slice(start_line.as_bytes());
    bytes.extend_from_slice(host.as_bytes());
    bytes
}

/// Host a received header was signed against: the original host of a proxied
/// request when present, otherwise `Host`.
pub fn signed_host(header: &HttpHeader) -> &str {
    header
        .get(names::X_FORWARDED_HOST)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header.get(names::HOST))
        .unwrap_or_default()
}

// ============================================================================
// Custom headers
// ============================================================================

/// Value of a custom header: one scalar, or a list emitted as repeated fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    List(Vec<String>),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Single(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Single(value.to_string())
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        HeaderValue::List(values)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(values: Vec<&str>) -> Self {
        HeaderValue::List(values.into_iter().map(str::to_string).collect())
    }
}

/// Ordered application-supplied header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomHeaders {
    entries: Vec<(String, HeaderValue)>,
}

impl CustomHeaders {
    pub fn set(&mut self, name: &str, value: impl Into<HeaderValue>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Write these fields into `header`, before any protocol-managed fields.
    pub fn apply_to(&self, header: &mut HttpHeader) {
        for (name, value) in &self.entries {
            match value {
                HeaderValue::Single(v) => header.set(name, v.clone()),
                HeaderValue::List(values) => {
                    header.remove(name);
                    for v in values {
                        header.add(name, v.clone());
                    }
                }
            }
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// Readable body source for outbound streaming content.
pub type ContentSource = Box<dyn AsyncRead + Send + Unpin>;

/// Writable body sink for inbound streaming content.
pub type ContentSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
enum Content {
    #[default]
    Empty,
    Value(Value),
    Source {
        reader: ContentSource,
        length: Option<u64>,
    },
    Sink(ContentSink),
}

enum OutBody {
    None,
    Buffered(Vec<u8>),
    Stream {
        reader: ContentSource,
        chunked: bool,
        declared: Option<u64>,
    },
}

/// One direction of a BTP exchange.
pub struct BtpMessage {
    kind: MessageKind,
    status: SecurityStatus,
    breach: Option<BreachKind>,
    user_id: UserId,
    agent_user_id: UserId,
    agent_profile_id: ProfileId,
    signer: Option<Arc<Profile>>,
    key_resolver: Option<Arc<dyn KeyResolver>>,
    content_type: Option<String>,
    content: Content,
    custom_headers: CustomHeaders,
    save_headers: bool,
    saved_header: Option<HttpHeader>,
    content_verifier: Option<DigitalSignature>,
    content_length: u64,
}

impl Default for BtpMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl BtpMessage {
    pub fn new() -> Self {
        Self {
            kind: MessageKind::Get,
            status: SecurityStatus::Unchecked,
            breach: None,
            user_id: 0,
            agent_user_id: 0,
            agent_profile_id: 0,
            signer: None,
            key_resolver: None,
            content_type: None,
            content: Content::Empty,
            custom_headers: CustomHeaders::default(),
            save_headers: false,
            saved_header: None,
            content_verifier: None,
            content_length: 0,
        }
    }

    pub fn with_kind(kind: MessageKind) -> Self {
        let mut message = Self::new();
        message.kind = kind;
        message
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: MessageKind) {
        self.kind = kind;
    }

    // ------------------------------------------------------------------
    // Identities
    // ------------------------------------------------------------------

    /// Subject: the user the message is sent on behalf of.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn set_user_id(&mut self, user_id: UserId) {
        self.user_id = user_id;
    }

    /// User whose key signed (or will sign) the message.
    pub fn agent_user_id(&self) -> UserId {
        self.agent_user_id
    }

    pub fn agent_profile_id(&self) -> ProfileId {
        self.agent_profile_id
    }

    /// Bind the profile that signs this message when it is sent.
    ///
    /// If no subject has been set, the profile's user becomes the subject.
    pub fn set_signer(&mut self, profile: Option<Arc<Profile>>) {
        match &profile {
            Some(p) => {
                self.agent_user_id = p.user_id();
                self.agent_profile_id = p.profile_id();
                if self.user_id == 0 {
                    self.user_id = p.user_id();
                }
            }
            None => {
                self.agent_user_id = 0;
                self.agent_profile_id = 0;
            }
        }
        self.signer = profile;
    }

    pub fn signer(&self) -> Option<&Arc<Profile>> {
        self.signer.as_ref()
    }

    /// Attach the resolver used to check a received message.
    pub fn set_key_resolver(&mut self, resolver: Option<Arc<dyn KeyResolver>>) {
        self.key_resolver = resolver;
    }

    pub fn has_key_resolver(&self) -> bool {
        self.key_resolver.is_some()
    }

    // ------------------------------------------------------------------
    // Security status
    // ------------------------------------------------------------------

    pub fn security_status(&self) -> SecurityStatus {
        self.status
    }

    /// Why the message is in breach, if it is.
    pub fn breach(&self) -> Option<&BreachKind> {
        self.breach.as_ref()
    }

    fn mark(&mut self, status: SecurityStatus) {
        self.status = match (self.status, status) {
            (SecurityStatus::Breach, _) => SecurityStatus::Breach,
            (SecurityStatus::Secure, SecurityStatus::Unchecked) => SecurityStatus::Secure,
            (_, next) => next,
        };
    }

    /// Put the message into the `Breach` state. The first reason recorded wins.
    pub fn mark_breach(&mut self, kind: BreachKind) {
        if self.breach.is_none() {
            warn!(reason = %kind, "BTP message security breach");
            self.breach = Some(kind);
        }
        self.status = SecurityStatus::Breach;
    }

    /// `Err` carrying the breach reason if the message is in breach.
    pub fn ensure_not_breached(&self) -> Result<()> {
        match (&self.status, &self.breach) {
            (SecurityStatus::Breach, Some(kind)) => Err(BtpError::SecurityBreach(kind.clone())),
            (SecurityStatus::Breach, None) => Err(BtpError::SecurityBreach(BreachKind::Header)),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    /// MIME type of the content.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Set a structured payload, replacing any stream.
    pub fn set_content_value(&mut self, value: Value) {
        self.content = Content::Value(value);
    }

    /// Set a structured payload from a typed value.
    pub fn set_content_object<T: Serialize>(&mut self, object: &T) -> Result<()> {
        self.set_content_value(codec::to_value(object)?);
        Ok(())
    }

    /// Set a byte stream to send, replacing any structured payload.
    ///
    /// A known `length` is only used on the wire when the message is neither
    /// signed nor compressed; otherwise the stream is sent chunked.
    pub fn set_content_source(
        &mut self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        length: Option<u64>,
    ) {
        self.content = Content::Source {
            reader: Box::new(reader),
            length,
        };
    }

    /// Set where received body bytes are written instead of being decoded.
    pub fn set_content_sink(&mut self, writer: impl AsyncWrite + Send + Unpin + 'static) {
        self.content = Content::Sink(Box::new(writer));
    }

    pub fn take_content_sink(&mut self) -> Option<ContentSink> {
        match std::mem::take(&mut self.content) {
            Content::Sink(sink) => Some(sink),
            other => {
                self.content = other;
                None
            }
        }
    }

    pub fn content_value(&self) -> Option<&Value> {
        match &self.content {
            Content::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn take_content_value(&mut self) -> Option<Value> {
        match std::mem::take(&mut self.content) {
            Content::Value(value) => Some(value),
            other => {
                self.content = other;
                None
            }
        }
    }

    /// Decode the structured payload into a typed structure.
    pub fn content_object<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .content_value()
            .cloned()
            .ok_or_else(|| BtpError::Malformed("message has no structured content".to_string()))?;
        codec::from_value(value)
    }

    pub fn has_content(&self) -> bool {
        matches!(self.content, Content::Value(_) | Content::Source { .. })
    }

    pub fn clear_content(&mut self) {
        self.content = Content::Empty;
    }

    /// Logical length of the last body sent or received.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    // ------------------------------------------------------------------
    // Headers
    // ------------------------------------------------------------------

    pub fn custom_headers(&self) -> &CustomHeaders {
        &self.custom_headers
    }

    pub fn custom_headers_mut(&mut self) -> &mut CustomHeaders {
        &mut self.custom_headers
    }

    /// Keep a copy of the head sent or received.
    pub fn set_save_headers(&mut self, save: bool) {
        self.save_headers = save;
    }

    pub fn saved_header(&self) -> Option<&HttpHeader> {
        self.saved_header.as_ref()
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    fn prepare_body(
        &mut self,
        header: &mut HttpHeader,
        encoding: Option<ContentEncoding>,
    ) -> Result<OutBody> {
        match std::mem::take(&mut self.content) {
            Content::Value(value) => {
                let content_type = match &self.content_type {
                    Some(mime) => ContentType::from_header(mime)?,
                    None => ContentType::Json,
                };
                let plain = content_type.encode(&value)?;
                self.content = Content::Value(value);
                self.content_length = plain.len() as u64;

                header.set(names::CONTENT_TYPE, content_type.mime());
                if let Some(profile) = &self.signer {
                    if !plain.is_empty() {
                        header.set(names::BTP_CONTENT_SIGNATURE, profile.sign(&plain)?);
                    }
                }
                let wire = match encoding {
                    Some(encoding) => {
                        header.set(names::CONTENT_ENCODING, encoding.as_str());
                        let mut compressor = Compressor::new(encoding);
                        let mut wire = compressor.update(&plain)?;
                        wire.extend(compressor.finish()?);
                        wire
                    }
                    None => plain,
                };
                header.remove(names::TRANSFER_ENCODING);
                header.set(names::CONTENT_LENGTH, wire.len().to_string());
                Ok(OutBody::Buffered(wire))
            }
            Content::Source { reader, length } => {
                if let Some(mime) = &self.content_type {
                    header.set(names::CONTENT_TYPE, mime.clone());
                }
                if let Some(encoding) = encoding {
                    header.set(names::CONTENT_ENCODING, encoding.as_str());
                }
                let declared = length.filter(|_| self.signer.is_none() && encoding.is_none());
                let chunked = declared.is_none();
                if chunked {
                    header.remove(names::CONTENT_LENGTH);
                    header.set(names::TRANSFER_ENCODING, "chunked");
                    if self.signer.is_some() {
                        header.set(names::TRAILER, names::BTP_CONTENT_SIGNATURE);
                    }
                } else if let Some(length) = declared {
                    header.set(names::CONTENT_LENGTH, length.to_string());
                }
                Ok(OutBody::Stream {
                    reader,
                    chunked,
                    declared,
                })
            }
            other => {
                self.content = other;
                Ok(OutBody::None)
            }
        }
    }

    fn add_security_headers(&self, header: &mut HttpHeader) -> Result<()> {
        let Some(profile) = &self.signer else {
            return Ok(());
        };
        let user_id = if self.user_id == 0 {
            profile.user_id()
        } else {
            self.user_id
        };
        header.set(names::BTP_VERSION, BTP_VERSION);
        header.set(names::BTP_USER_ID, user_id.to_string());
        header.set(names::BTP_AGENT_USER_ID, profile.user_id().to_string());
        header.set(names::BTP_AGENT_PROFILE_ID, profile.profile_id().to_string());

        let host = header.get(names::HOST).unwrap_or_default().to_string();
        let signed = header_signature_bytes(&header.start_line(), &host);
        header.set(names::BTP_HEADER_SIGNATURE, profile.sign(&signed)?);
        Ok(())
    }

    /// Send `header` and this message's content over `conn`.
    ///
    /// `header` must already carry its start line and `Host`; the message
    /// adds custom headers, content framing and, when a signer is bound, the
    /// security fields and signatures.
    pub async fn send(
        &mut self,
        conn: &mut HttpConnection,
        mut header: HttpHeader,
        encoding: Option<ContentEncoding>,
    ) -> Result<()> {
        self.custom_headers.apply_to(&mut header);
        let body = self.prepare_body(&mut header, encoding)?;
        self.add_security_headers(&mut header)?;
        if self.save_headers {
            self.saved_header = Some(header.clone());
        }

        conn.send_header(&header).await?;
        match body {
            OutBody::None => self.content_length = 0,
            OutBody::Buffered(wire) => conn.write_raw(&wire).await?,
            OutBody::Stream {
                mut reader,
                chunked,
                declared,
            } => {
                self.stream_body(conn, &mut reader, chunked, encoding)
                    .await?;
                if let Some(declared) = declared {
                    if declared != self.content_length {
                        return Err(BtpError::Malformed(format!(
                            "content source produced {} bytes, {declared} declared",
                            self.content_length
                        )));
                    }
                }
            }
        }
        conn.flush().await
    }

    async fn stream_body(
        &mut self,
        conn: &mut HttpConnection,
        reader: &mut ContentSource,
        chunked: bool,
        encoding: Option<ContentEncoding>,
    ) -> Result<()> {
        let mut trailer = match &self.signer {
            Some(profile) => SignedTrailer::with_signature(profile.signer()),
            None => SignedTrailer::new(),
        };
        let mut compressor = encoding.map(Compressor::new);
        let mut buf = vec![0u8; BODY_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            trailer.update(data);
            match &mut compressor {
                Some(compressor) => {
                    let wire = compressor.update(data)?;
                    write_body(conn, chunked, &wire).await?;
                }
                None => write_body(conn, chunked, data).await?,
            }
        }
        if let Some(compressor) = compressor {
            let tail = compressor.finish()?;
            write_body(conn, chunked, &tail).await?;
        }

        self.content_length = trailer.content_length();
        if chunked {
            trailer.finalize()?;
            conn.write_last_chunk(trailer.fields()).await?;
        }
        debug!(
            bytes = self.content_length,
            chunked,
            signed = self.signer.is_some(),
            "Streamed BTP content"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Check the security fields of a received head.
    ///
    /// Without a key resolver the message stays `Unchecked`. With one, the
    /// claim must be complete, use the supported version, name a resolvable
    /// key that is allowed to sign for the subject, and carry a valid
    /// signature over the start line and host.
    pub async fn check_header_security(&mut self, header: &HttpHeader) -> SecurityStatus {
        if self.save_headers {
            self.saved_header = Some(header.clone());
        }

        let parse_id = |name: &str| -> Option<u64> {
            header
                .get(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|id| *id != 0)
        };
        let claim = match (
            parse_id(names::BTP_USER_ID),
            parse_id(names::BTP_AGENT_USER_ID),
            parse_id(names::BTP_AGENT_PROFILE_ID),
            header
                .get(names::BTP_HEADER_SIGNATURE)
                .filter(|s| !s.trim().is_empty()),
        ) {
            (Some(user), Some(agent), Some(profile), Some(signature)) => {
                self.user_id = user;
                self.agent_user_id = agent;
                self.agent_profile_id = profile;
                Some(signature)
            }
            _ => {
                self.user_id = 0;
                self.agent_user_id = 0;
                self.agent_profile_id = 0;
                None
            }
        };

        let Some(resolver) = self.key_resolver.clone() else {
            self.mark(SecurityStatus::Unchecked);
            return self.status;
        };

        let Some(signature) = claim else {
            debug!("Incomplete BTP security claim");
            self.mark_breach(BreachKind::Header);
            return self.status;
        };
        if header.get(names::BTP_VERSION) != Some(BTP_VERSION) {
            debug!(version = ?header.get(names::BTP_VERSION), "Unsupported BTP version");
            self.mark_breach(BreachKind::Header);
            return self.status;
        }

        let (user_id, agent_user_id, profile_id) =
            (self.user_id, self.agent_user_id, self.agent_profile_id);
        let Some(key) = resolver.resolve(agent_user_id, profile_id).await else {
            self.mark_breach(BreachKind::KeyUnresolvable {
                user_id: agent_user_id,
                profile_id,
            });
            return self.status;
        };
        if agent_user_id != user_id && !key.is_delegate {
            self.mark_breach(BreachKind::DelegateUnauthorized {
                user_id,
                agent_user_id,
            });
            return self.status;
        }

        let signed = header_signature_bytes(&header.start_line(), signed_host(header));
        match verify_signature(&key.public_key, &signed, signature) {
            Ok(()) => {
                self.content_verifier = Some(DigitalSignature::for_verifying(key.public_key));
                self.mark(SecurityStatus::Secure);
            }
            Err(e) => {
                debug!(error = %e, "Header signature rejected");
                self.mark_breach(BreachKind::Header);
            }
        }
        self.status
    }

    /// Read a body, decompressing it and feeding the content signature.
    ///
    /// Bytes go to `sink` when one is given, otherwise they are buffered and
    /// returned.
    async fn receive_body(
        &mut self,
        conn: &mut HttpConnection,
        header: &HttpHeader,
        framing: BodyFraming,
        mut sink: Option<&mut ContentSink>,
    ) -> Result<(Vec<u8>, SignedTrailer)> {
        let mut body = BodyReader::new(framing);
        let mut trailer = match self.content_verifier.take() {
            Some(verifier) => SignedTrailer::with_signature(verifier),
            None => SignedTrailer::new(),
        };
        let mut decompressor = header
            .get(names::CONTENT_ENCODING)
            .and_then(ContentEncoding::from_header)
            .map(Decompressor::new);
        let mut buffered = Vec::new();

        loop {
            let plain = match conn.read_body(&mut body).await? {
                Some(wire) => match &mut decompressor {
                    Some(d) => d.update(&wire).map_err(|e| {
                        BtpError::Malformed(format!("could not decompress content: {e}"))
                    })?,
                    None => wire,
                },
                None => match decompressor.take() {
                    Some(d) => {
                        let tail = d.finish().map_err(|e| {
                            BtpError::Malformed(format!("could not decompress content: {e}"))
                        })?;
                        if tail.is_empty() {
                            break;
                        }
                        tail
                    }
                    None => break,
                },
            };

            trailer.update(&plain);
            match &mut sink {
                Some(sink) => sink.write_all(&plain).await?,
                None => {
                    if buffered.len() + plain.len() > MAX_STRUCTURED_CONTENT {
                        return Err(BtpError::Malformed(
                            "structured content too large".to_string(),
                        ));
                    }
                    buffered.extend_from_slice(&plain);
                }
            }
        }

        if let Some(sink) = &mut sink {
            sink.flush().await?;
        }
        trailer.absorb(body.trailer());
        self.content_length = trailer.content_length();
        Ok((buffered, trailer))
    }

    fn check_content_security(&mut self, header: &HttpHeader, trailer: &SignedTrailer) {
        if self.key_resolver.is_none() || trailer.content_length() == 0 {
            return;
        }
        let signature = trailer
            .content_signature()
            .or_else(|| header.get(names::BTP_CONTENT_SIGNATURE));
        match signature {
            Some(signature) if trailer.verify(signature) => self.mark(SecurityStatus::Secure),
            _ => self.mark_breach(BreachKind::Content),
        }
    }

    /// Receive the body that follows `header` into this message.
    ///
    /// With a sink set, bytes are streamed into it. Otherwise the body is
    /// decoded according to its `Content-Type` into a structured payload.
    /// The content signature is checked when a key resolver is attached.
    pub async fn receive_content(
        &mut self,
        conn: &mut HttpConnection,
        header: &HttpHeader,
        framing: BodyFraming,
    ) -> Result<()> {
        let mut sink = self.take_content_sink();
        let (buffered, trailer) = self
            .receive_body(conn, header, framing, sink.as_mut())
            .await?;
        self.check_content_security(header, &trailer);

        if let Some(sink) = sink {
            self.content = Content::Sink(sink);
            return Ok(());
        }
        if buffered.is_empty() {
            return Ok(());
        }
        let mime = header.get(names::CONTENT_TYPE).unwrap_or_default();
        let content_type = ContentType::from_header(mime)?;
        self.content_type = Some(mime.to_string());
        self.content = Content::Value(content_type.decode(&buffered)?);
        Ok(())
    }

    /// Receive the body of a failed response as a structured error.
    ///
    /// Returns `None` when the body is empty or is not an error payload.
    pub async fn receive_error(
        &mut self,
        conn: &mut HttpConnection,
        header: &HttpHeader,
        framing: BodyFraming,
    ) -> Result<Option<ErrorPayload>> {
        let (buffered, trailer) = self.receive_body(conn, header, framing, None).await?;
        self.check_content_security(header, &trailer);
        if buffered.is_empty() {
            return Ok(None);
        }
        let payload = header
            .get(names::CONTENT_TYPE)
            .and_then(|mime| ContentType::from_header(mime).ok())
            .and_then(|content_type| content_type.decode(&buffered).ok())
            .and_then(|value| codec::from_value::<ErrorPayload>(value).ok());
        Ok(payload)
    }
}

async fn write_body(conn: &mut HttpConnection, chunked: bool, data: &[u8]) -> Result<()> {
    if chunked {
        conn.write_chunk(data).await
    } else {
        conn.write_raw(data).await
    }
}

impl std::fmt::Debug for BtpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtpMessage")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("user_id", &self.user_id)
            .field("agent_user_id", &self.agent_user_id)
            .field("agent_profile_id", &self.agent_profile_id)
            .field("content_type", &self.content_type)
            .field("signed", &self.signer.is_some())
            .finish()
    }
}
