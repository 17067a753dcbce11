//! Error types for BTP.
//!
//! Everything that can go wrong during an exchange is a [`BtpError`]. Errors
//! that cross the wire are converted to an [`ErrorPayload`], the structured
//! value carried in the body of a failed response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use btp_crypto::{ProfileId, SignatureError, UserId};

// ============================================================================
// Wire error payload
// ============================================================================

/// Structured error carried in the body of a response with status >= 400.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable kind, e.g. `bitmunk.protocol.Security`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub code: u16,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorPayload>>,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            code: 0,
            details: Map::new(),
            cause: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorPayload) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterate this error and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorPayload> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Security breaches
// ============================================================================

/// Why a message was put into the `Breach` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreachKind {
    /// Header security claim incomplete, unsupported or badly signed.
    Header,
    /// Content signature missing or invalid.
    Content,
    /// Response reflected a different Host than the request addressed.
    HostMismatch {
        request_host: String,
        response_host: String,
    },
    /// No public key could be found for the signer.
    KeyUnresolvable { user_id: UserId, profile_id: ProfileId },
    /// Signer is not the subject and its key is not a delegate key.
    DelegateUnauthorized { user_id: UserId, agent_user_id: UserId },
}

impl std::fmt::Display for BreachKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreachKind::Header => write!(f, "header security breach"),
            BreachKind::Content => write!(f, "content security breach"),
            BreachKind::HostMismatch {
                request_host,
                response_host,
            } => write!(
                f,
                "response host '{response_host}' does not match request host '{request_host}'"
            ),
            BreachKind::KeyUnresolvable {
                user_id,
                profile_id,
            } => write!(f, "no public key for user {user_id} profile {profile_id}"),
            BreachKind::DelegateUnauthorized {
                user_id,
                agent_user_id,
            } => write!(
                f,
                "user {agent_user_id} is not a delegate authorized to sign for user {user_id}"
            ),
        }
    }
}

// ============================================================================
// Client-side status classes
// ============================================================================

/// Typed 4xx response classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    Forbidden,
    NotFound,
    MethodNotAllowed,
    BadRequest,
}

impl ClientErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            403 => ClientErrorKind::Forbidden,
            404 => ClientErrorKind::NotFound,
            405 => ClientErrorKind::MethodNotAllowed,
            _ => ClientErrorKind::BadRequest,
        }
    }

    fn wire_kind(self) -> &'static str {
        match self {
            ClientErrorKind::Forbidden => "bitmunk.protocol.ResourceForbidden",
            ClientErrorKind::NotFound => "bitmunk.protocol.ResourceNotFound",
            ClientErrorKind::MethodNotAllowed => "bitmunk.protocol.MethodNotAllowed",
            ClientErrorKind::BadRequest => "bitmunk.protocol.BadRequest",
        }
    }
}

// ============================================================================
// BtpError
// ============================================================================

/// Errors produced by BTP clients, servers and message handling.
#[derive(Debug, Error)]
pub enum BtpError {
    /// Could not reach the peer.
    #[error("could not establish BTP connection to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A connect, read or write did not complete in time.
    #[error("BTP operation timed out")]
    Timeout,

    #[error("tls error: {0}")]
    Tls(String),

    /// The message failed a security check. Terminal for that message.
    #[error("message security breach: {0}")]
    SecurityBreach(BreachKind),

    /// A resource requires a signed message and none was supplied.
    #[error("secure message required for {method} {resource}")]
    SecurityRequired { resource: String, method: String },

    /// A resource requires TLS and the request arrived in plain text.
    #[error("secure connection required for {resource}")]
    SecureConnectionRequired { resource: String },

    /// No profile is available to sign a response to a secure request.
    #[error("no profile available to sign the response for {resource}")]
    SecureResourceNotAvailable { resource: String },

    /// Response status >= 500.
    #[error("server error ({status}) from {resource}")]
    Server {
        status: u16,
        resource: String,
        remote: Option<ErrorPayload>,
    },

    /// Response status 400-499.
    #[error("client error ({status}) from {resource}")]
    Client {
        kind: ClientErrorKind,
        status: u16,
        resource: String,
        remote: Option<ErrorPayload>,
    },

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("no service registered for {domain}{path}")]
    NoMatchingService { domain: String, path: String },

    /// No route of a resource takes the request's parameters.
    #[error("resource not found: {resource}")]
    ResourceNotFound { resource: String },

    /// The resource exists but does not handle the request method.
    #[error("method {method} not allowed for {resource}")]
    MethodNotAllowed {
        resource: String,
        method: String,
        allowed: Vec<String>,
    },

    /// Request parameters, query or content failed validation.
    #[error("invalid {target}: {reason}")]
    Validation { target: String, reason: String },

    /// A message could not be parsed or its payload could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("could not encode content: {0}")]
    Encode(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// An application-level failure raised by a handler.
    #[error("{0}")]
    Action(ErrorPayload),
}

impl BtpError {
    /// Shorthand for raising an application error from a handler.
    pub fn action(kind: impl Into<String>, message: impl Into<String>, code: u16) -> Self {
        BtpError::Action(ErrorPayload::new(kind, message).with_code(code))
    }

    /// Response status this error is reported with when it ends an action.
    pub fn status(&self) -> u16 {
        match self {
            BtpError::SecurityBreach(_)
            | BtpError::SecurityRequired { .. }
            | BtpError::SecureConnectionRequired { .. }
            | BtpError::SecureResourceNotAvailable { .. }
            | BtpError::UnsupportedContentType(_)
            | BtpError::Validation { .. }
            | BtpError::Malformed(_) => 400,
            BtpError::NoMatchingService { .. } | BtpError::ResourceNotFound { .. } => 404,
            BtpError::MethodNotAllowed { .. } => 405,
            BtpError::Client { status, .. } | BtpError::Server { status, .. } => *status,
            BtpError::Action(payload) if payload.code >= 400 => payload.code,
            _ => 500,
        }
    }

    /// Whether the failure is attributable to the caller rather than the server.
    pub fn is_client_error(&self) -> bool {
        self.status() < 500
    }

    /// Transport failures that a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BtpError::Connect { .. } | BtpError::Io(_) | BtpError::Timeout
        )
    }

    pub fn is_breach(&self) -> bool {
        matches!(self, BtpError::SecurityBreach(_))
    }

    /// Machine-readable kind used on the wire.
    pub fn kind(&self) -> &str {
        match self {
            BtpError::Connect { .. } => "bitmunk.protocol.ConnectError",
            BtpError::Io(_) => "bitmunk.protocol.IoError",
            BtpError::Timeout => "bitmunk.protocol.Timeout",
            BtpError::Tls(_) => "bitmunk.protocol.TlsError",
            BtpError::SecurityBreach(_) | BtpError::SecurityRequired { .. } => {
                "bitmunk.protocol.Security"
            }
            BtpError::SecureConnectionRequired { .. } => {
                "bitmunk.protocol.SecurityConnectionRequired"
            }
            BtpError::SecureResourceNotAvailable { .. } => {
                "bitmunk.protocol.SecureResourceNotAvailable"
            }
            BtpError::Server { .. } => "bitmunk.protocol.ServerError",
            BtpError::Client { kind, .. } => kind.wire_kind(),
            BtpError::UnsupportedContentType(_) => "bitmunk.protocol.InvalidContentType",
            BtpError::NoMatchingService { .. } => "bitmunk.protocol.NoMatchingService",
            BtpError::ResourceNotFound { .. } => "bitmunk.protocol.ResourceNotFound",
            BtpError::MethodNotAllowed { .. } => "bitmunk.protocol.MethodNotAllowed",
            BtpError::Validation { .. } => "bitmunk.protocol.ValidationError",
            BtpError::Malformed(_) => "bitmunk.protocol.MalformedMessage",
            BtpError::Encode(_) => "bitmunk.protocol.EncodeError",
            BtpError::Signature(_) => "bitmunk.protocol.SignatureError",
            BtpError::Action(payload) => &payload.kind,
        }
    }

    /// The structured error a remote peer sent, if any.
    pub fn remote(&self) -> Option<&ErrorPayload> {
        match self {
            BtpError::Server { remote, .. } | BtpError::Client { remote, .. } => remote.as_ref(),
            _ => None,
        }
    }

    /// Convert to the structured value sent in an error response.
    pub fn to_payload(&self) -> ErrorPayload {
        if let BtpError::Action(payload) = self {
            let mut payload = payload.clone();
            payload.code = self.status();
            return payload;
        }

        let mut payload = ErrorPayload::new(self.kind(), self.to_string()).with_code(self.status());
        match self {
            BtpError::Connect { url, .. } => {
                payload = payload.with_detail("url", url.as_str());
            }
            BtpError::SecurityRequired { resource, method } => {
                payload = payload
                    .with_detail("resource", resource.as_str())
                    .with_detail("method", method.as_str());
            }
            BtpError::SecureConnectionRequired { resource }
            | BtpError::SecureResourceNotAvailable { resource }
            | BtpError::ResourceNotFound { resource } => {
                payload = payload.with_detail("resource", resource.as_str());
            }
            BtpError::SecurityBreach(BreachKind::HostMismatch {
                request_host,
                response_host,
            }) => {
                payload = payload
                    .with_detail("requestHost", request_host.as_str())
                    .with_detail("responseHost", response_host.as_str());
            }
            BtpError::Server {
                resource, remote, ..
            }
            | BtpError::Client {
                resource, remote, ..
            } => {
                payload = payload.with_detail("resource", resource.as_str());
                if let Some(remote) = remote {
                    payload = payload.with_cause(remote.clone());
                }
            }
            BtpError::UnsupportedContentType(content_type) => {
                payload = payload.with_detail("contentType", content_type.as_str());
            }
            BtpError::MethodNotAllowed {
                resource,
                method,
                allowed,
            } => {
                payload = payload
                    .with_detail("resource", resource.as_str())
                    .with_detail("invalidMethod", method.as_str())
                    .with_detail("validTypes", allowed.clone());
            }
            BtpError::Validation { target, reason } => {
                payload = payload
                    .with_detail("target", target.as_str())
                    .with_detail("reason", reason.as_str());
            }
            BtpError::NoMatchingService { domain, path } => {
                payload = payload
                    .with_detail("domain", domain.as_str())
                    .with_detail("path", path.as_str());
            }
            _ => {}
        }
        payload
    }
}

pub type Result<T> = std::result::Result<T, BtpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_attribution() {
        assert_eq!(
            BtpError::SecurityRequired {
                resource: "/r".into(),
                method: "GET".into()
            }
            .status(),
            400
        );
        assert!(BtpError::UnsupportedContentType("image/png".into()).is_client_error());
        assert!(!BtpError::Encode("boom".into()).is_client_error());
        assert_eq!(BtpError::action("app.Conflict", "taken", 409).status(), 409);
        assert_eq!(BtpError::action("app.Oops", "failed", 0).status(), 500);
    }

    #[test]
    fn test_payload_round_trip_through_json() {
        let err = BtpError::Client {
            kind: ClientErrorKind::NotFound,
            status: 404,
            resource: "/api/x".into(),
            remote: Some(ErrorPayload::new("app.Missing", "no such thing")),
        };
        let payload = err.to_payload();
        assert_eq!(payload.kind, "bitmunk.protocol.ResourceNotFound");
        assert_eq!(payload.code, 404);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "bitmunk.protocol.ResourceNotFound");
        assert_eq!(json["details"]["resource"], "/api/x");

        let back: ErrorPayload = serde_json::from_value(json).unwrap();
        let kinds: Vec<_> = back.chain().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["bitmunk.protocol.ResourceNotFound", "app.Missing"]);
    }

    #[test]
    fn test_retryable() {
        assert!(BtpError::Timeout.is_retryable());
        assert!(!BtpError::SecurityBreach(BreachKind::Header).is_retryable());
    }

    #[test]
    fn test_client_kind_mapping() {
        assert_eq!(ClientErrorKind::from_status(403), ClientErrorKind::Forbidden);
        assert_eq!(ClientErrorKind::from_status(405), ClientErrorKind::MethodNotAllowed);
        assert_eq!(ClientErrorKind::from_status(418), ClientErrorKind::BadRequest);
    }
}
