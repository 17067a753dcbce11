//! One request/response cycle on the server side.
//!
//! An [`Action`] owns the connection for the duration of the cycle. It
//! gives handlers lazy, cached access to the resource parameters, query
//! variables and request content, and exactly one way to complete: a
//! result or an exception. Every completion after the first is a no-op.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use btp_crypto::{Profile, UserId};

use crate::codec::{self, ContentType};
use crate::encoding::ContentEncoding;
use crate::errors::{BtpError, Result};
use crate::http::{names, BodyFraming, HttpConnection, HttpHeader};
use crate::keys::KeyResolver;
use crate::message::{signed_host, BtpMessage, MessageKind, SecurityStatus};

/// `Server` sent with every response.
pub const SERVER_NAME: &str = "BtpServer/1.0";

/// A request being serviced.
pub struct Action {
    conn: HttpConnection,
    request: HttpHeader,
    response: HttpHeader,
    status_set: bool,
    resource: String,
    base_path: Option<String>,
    in_message: BtpMessage,
    out_message: BtpMessage,
    params: Option<Vec<String>>,
    query: Option<Map<String, Value>>,
    array_query: Option<Map<String, Value>>,
    content: Option<Value>,
    security_checked: bool,
    result_sent: bool,
    select_content_encoding: bool,
}

impl Action {
    /// Start servicing `request` for `resource`, the normalized request
    /// target including any query.
    pub fn new(conn: HttpConnection, request: HttpHeader, resource: impl Into<String>) -> Self {
        let mut in_message = BtpMessage::new();
        if let Some(kind) = request.method().and_then(MessageKind::parse) {
            in_message.set_kind(kind);
        }
        let mut response = HttpHeader::response(200);
        response.set_version(request.version());
        Self {
            conn,
            request,
            response,
            status_set: false,
            resource: resource.into(),
            base_path: None,
            in_message,
            out_message: BtpMessage::new(),
            params: None,
            query: None,
            array_query: None,
            content: None,
            security_checked: false,
            result_sent: false,
            select_content_encoding: true,
        }
    }

    /// End the action and hand back its connection.
    pub fn into_connection(self) -> HttpConnection {
        self.conn
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Resource path without the query.
    pub fn resource_path(&self) -> &str {
        self.resource
            .split_once('?')
            .map_or(self.resource.as_str(), |(path, _)| path)
    }

    /// Path of the handler servicing this action; parameters are the path
    /// segments below it.
    pub fn set_base_path(&mut self, base: &str) {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        self.base_path = Some(base);
        self.params = None;
    }

    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    pub fn request(&self) -> &HttpHeader {
        &self.request
    }

    pub fn response(&self) -> &HttpHeader {
        &self.response
    }

    /// Fields set here are sent with whatever result completes the action.
    pub fn response_mut(&mut self) -> &mut HttpHeader {
        &mut self.response
    }

    pub fn set_response_status(&mut self, status: u16) {
        self.response.set_status(status);
        self.status_set = true;
    }

    pub fn is_secure(&self) -> bool {
        self.conn.is_secure()
    }

    pub fn connection(&self) -> &HttpConnection {
        &self.conn
    }

    pub fn in_message(&self) -> &BtpMessage {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut BtpMessage {
        &mut self.in_message
    }

    pub fn out_message(&self) -> &BtpMessage {
        &self.out_message
    }

    pub fn out_message_mut(&mut self) -> &mut BtpMessage {
        &mut self.out_message
    }

    pub fn is_result_sent(&self) -> bool {
        self.result_sent
    }

    /// Whether results may be compressed according to the request.
    pub fn set_select_content_encoding(&mut self, on: bool) {
        self.select_content_encoding = on;
    }

    // ------------------------------------------------------------------
    // Request data
    // ------------------------------------------------------------------

    /// Path segments below the base path. Parsed once, then cloned.
    pub fn resource_params(&mut self) -> Vec<String> {
        if self.params.is_none() {
            let path = self.resource_path();
            let rest = match &self.base_path {
                Some(base) => path.strip_prefix(base.as_str()).unwrap_or_default(),
                None => path,
            };
            let params = rest
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            self.params = Some(params);
        }
        self.params.clone().unwrap_or_default()
    }

    /// Query variables. Parsed once, then cloned.
    ///
    /// With `as_arrays` every value is an array holding each occurrence of
    /// the key; otherwise the last occurrence wins.
    pub fn resource_query(&mut self, as_arrays: bool) -> Map<String, Value> {
        let cache = if as_arrays {
            &mut self.array_query
        } else {
            &mut self.query
        };
        if cache.is_none() {
            let query = self
                .resource
                .split_once('?')
                .map_or("", |(_, query)| query);
            let mut vars = Map::new();
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                let value = Value::String(value.into_owned());
                if as_arrays {
                    match vars
                        .entry(key.into_owned())
                        .or_insert_with(|| Value::Array(Vec::new()))
                    {
                        Value::Array(values) => values.push(value),
                        other => *other = Value::Array(vec![value]),
                    }
                } else {
                    vars.insert(key.into_owned(), value);
                }
            }
            *cache = Some(vars);
        }
        cache.clone().unwrap_or_default()
    }

    /// Query variables decoded into a typed structure.
    pub fn query<T: DeserializeOwned>(&mut self) -> Result<T> {
        codec::from_value(Value::Object(self.resource_query(false)))
    }

    pub fn query_value(&mut self, name: &str) -> Option<String> {
        self.resource_query(false)
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The user a request asks the node to act as, from `nodeuser`.
    pub fn node_user(&mut self) -> Option<UserId> {
        self.query_value("nodeuser")
            .and_then(|v| v.parse::<UserId>().ok())
            .filter(|id| *id != 0)
    }

    /// Whether the request carries a security claim.
    pub fn has_security_claim(&self) -> bool {
        self.request.has(names::BTP_USER_ID)
    }

    /// Verify the request head with `resolver`.
    ///
    /// After this, received content is checked too, and a breach found in
    /// the content fails [`Action::receive_content`].
    pub async fn check_header_security(
        &mut self,
        resolver: Option<Arc<dyn KeyResolver>>,
    ) -> SecurityStatus {
        self.in_message.set_key_resolver(resolver);
        self.security_checked = true;
        self.in_message.check_header_security(&self.request).await
    }

    /// Whether the request head has been verified.
    pub fn is_security_checked(&self) -> bool {
        self.security_checked
    }

    /// Fail unless the request passed its security check.
    pub fn check_security(&self) -> Result<()> {
        match self.in_message.security_status() {
            SecurityStatus::Secure => Ok(()),
            SecurityStatus::Unchecked => Err(BtpError::SecurityRequired {
                resource: self.resource.clone(),
                method: self.in_message.kind().to_string(),
            }),
            SecurityStatus::Breach => self.in_message.ensure_not_breached(),
        }
    }

    /// Sign the response as `profile`.
    pub fn set_responder(&mut self, profile: Option<Arc<Profile>>) {
        if let Some(p) = &profile {
            self.out_message.set_user_id(p.user_id());
        }
        self.out_message.set_signer(profile);
    }

    fn request_framing(&self) -> BodyFraming {
        BodyFraming::for_request(&self.request)
    }

    /// The request content as a structured value, `Null` when there is none.
    ///
    /// Received once; later calls return a clone.
    pub async fn receive_content(&mut self) -> Result<Value> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        let framing = self.request_framing();
        let content = if framing == BodyFraming::None {
            Value::Null
        } else {
            self.in_message
                .receive_content(&mut self.conn, &self.request, framing)
                .await?;
            if self.security_checked {
                self.in_message.ensure_not_breached()?;
            }
            self.in_message.take_content_value().unwrap_or(Value::Null)
        };
        self.content = Some(content.clone());
        Ok(content)
    }

    /// The request content decoded into a typed structure.
    pub async fn content<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.receive_content().await?;
        codec::from_value(value)
    }

    /// Stream the request body into `sink`.
    pub async fn receive_content_into(
        &mut self,
        sink: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<()> {
        let framing = self.request_framing();
        self.in_message.set_content_sink(sink);
        self.in_message
            .receive_content(&mut self.conn, &self.request, framing)
            .await?;
        if self.security_checked {
            self.in_message.ensure_not_breached()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn result_content_type(&self) -> ContentType {
        ContentType::for_accept(self.request.get(names::ACCEPT))
    }

    fn negotiate_encoding(&self) -> Option<ContentEncoding> {
        if let Some(set) = self.response.get(names::CONTENT_ENCODING) {
            return ContentEncoding::from_header(set);
        }
        if !self.select_content_encoding {
            return None;
        }
        ContentEncoding::negotiate(
            self.request.get(names::USER_AGENT),
            self.request.get(names::ACCEPT_ENCODING),
        )
    }

    async fn send_response(&mut self, encoding: Option<ContentEncoding>) -> Result<()> {
        let mut header = self.response.clone();
        header.set(names::SERVER, SERVER_NAME);
        header.set(names::CONNECTION, "close");
        let host = signed_host(&self.request).to_string();
        if !host.is_empty() {
            header.set(names::HOST, host);
        }
        self.out_message.send(&mut self.conn, header, encoding).await?;
        self.result_sent = true;
        debug!(
            resource = %self.resource,
            status = ?self.response.status(),
            "Sent BTP response"
        );
        Ok(())
    }

    /// Complete without a body: 204, or the status already set with an
    /// empty body.
    pub async fn send_result(&mut self) -> Result<()> {
        if self.result_sent {
            return Ok(());
        }
        if self.status_set {
            self.response.set(names::CONTENT_LENGTH, "0");
        } else {
            self.response.set_status(204);
        }
        self.out_message.clear_content();
        self.send_response(None).await
    }

    /// Complete with a byte stream.
    pub async fn send_result_stream(
        &mut self,
        source: impl AsyncRead + Send + Unpin + 'static,
        length: Option<u64>,
    ) -> Result<()> {
        if self.result_sent {
            return Ok(());
        }
        self.out_message.set_content_source(source, length);
        let encoding = self.negotiate_encoding();
        self.send_response(encoding).await
    }

    /// Complete with a structured value in the negotiated content type.
    pub async fn send_result_value(&mut self, value: Value) -> Result<()> {
        if self.result_sent {
            return Ok(());
        }
        if !self.status_set {
            self.response.set_status(200);
        }
        let content_type = self.result_content_type();
        self.out_message.set_content_value(value);
        self.out_message.set_content_type(content_type.mime());
        let encoding = self.negotiate_encoding();
        self.send_response(encoding).await
    }

    pub async fn send_result_object<T: Serialize>(&mut self, result: &T) -> Result<()> {
        let value = codec::to_value(result)?;
        self.send_result_value(value).await
    }

    /// Mark the response as having created `location`.
    pub fn set_resource_created(&mut self, location: &str) {
        self.response.set(names::LOCATION, location);
        self.set_response_status(201);
    }

    /// Complete with 201 and a `Location`.
    pub async fn send_created(&mut self, location: &str) -> Result<()> {
        self.set_resource_created(location);
        self.send_result().await
    }

    /// Complete with an error payload.
    ///
    /// Unless a status was already set, a caller-attributable error is
    /// answered with its 4xx status (400 by default) and anything else with
    /// its 5xx status (500 by default).
    pub async fn send_exception(&mut self, error: &BtpError, client: bool) -> Result<()> {
        if self.result_sent {
            return Ok(());
        }
        if !self.status_set {
            let code = error.status();
            let status = match (client, code) {
                (true, 400..=499) => code,
                (true, _) => 400,
                (false, 500..=599) => code,
                (false, _) => 500,
            };
            self.response.set_status(status);
        }
        debug!(resource = %self.resource, error = %error, "Exception while serving resource");

        let content_type = self.result_content_type();
        self.out_message.set_content_object(&error.to_payload())?;
        self.out_message.set_content_type(content_type.mime());
        let encoding = self.negotiate_encoding();
        self.send_response(encoding).await
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("resource", &self.resource)
            .field("base_path", &self.base_path)
            .field("result_sent", &self.result_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn action_for(raw_request: &str) -> (Action, tokio::io::DuplexStream) {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        client.write_all(raw_request.as_bytes()).await.unwrap();
        let mut conn = HttpConnection::new(server, false);
        let request = conn.receive_header().await.unwrap().unwrap();
        let resource = request.path().unwrap_or("/").to_string();
        (Action::new(conn, request, resource), client)
    }

    async fn response_text(action: Action, mut client: tokio::io::DuplexStream) -> String {
        drop(action);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_params_and_query() {
        let (mut action, _client) =
            action_for("GET /api/3.0/wares/12/files?nodeuser=9&tag=a&tag=b HTTP/1.1\r\nHost: h\r\n\r\n")
                .await;
        action.set_base_path("/api/3.0/wares");
        assert_eq!(action.resource_params(), vec!["12", "files"]);
        assert_eq!(action.node_user(), Some(9));

        let query = action.resource_query(false);
        assert_eq!(query["tag"], json!("b"));
        let arrays = action.resource_query(true);
        assert_eq!(arrays["tag"], json!(["a", "b"]));

        let mut cloned = action.resource_query(false);
        cloned.insert("tag".into(), json!("z"));
        assert_eq!(action.resource_query(false)["tag"], json!("b"));
    }

    #[tokio::test]
    async fn test_send_result_is_idempotent() {
        let (mut action, client) = action_for("GET /x HTTP/1.1\r\nHost: node:1\r\n\r\n").await;
        action.send_result().await.unwrap();
        let written = action.connection().bytes_written();
        action.send_result().await.unwrap();
        action
            .send_result_value(json!({"late": true}))
            .await
            .unwrap();
        assert_eq!(action.connection().bytes_written(), written);

        let text = response_text(action, client).await;
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert_eq!(text.matches("HTTP/1.1").count(), 1);
        assert!(text.contains("Server: BtpServer/1.0\r\n"));
        assert!(text.contains("Host: node:1\r\n"));
    }

    #[tokio::test]
    async fn test_exception_negotiates_xml() {
        let (mut action, client) =
            action_for("GET /x HTTP/1.1\r\nHost: h\r\nAccept: text/xml\r\n\r\n").await;
        let error = BtpError::action("bitmunk.test.Failure", "nope", 409);
        action.send_exception(&error, true).await.unwrap();

        let text = response_text(action, client).await;
        assert!(text.starts_with("HTTP/1.1 409 Conflict\r\n"));
        assert!(text.contains("Content-Type: text/xml"));
        assert!(text.contains("<?xml"));
    }

    #[tokio::test]
    async fn test_exception_defaults_to_json_and_500() {
        let (mut action, client) = action_for("GET /x HTTP/1.1\r\nHost: h\r\n\r\n").await;
        let error = BtpError::Malformed("broken".to_string());
        action.send_exception(&error, false).await.unwrap();

        let text = response_text(action, client).await;
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Content-Type: application/json"));
    }

    #[tokio::test]
    async fn test_send_created() {
        let (mut action, client) = action_for("POST /wares HTTP/1.1\r\nHost: h\r\n\r\n").await;
        action.send_created("/wares/5").await.unwrap();
        let text = response_text(action, client).await;
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Location: /wares/5\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn test_content_cached() {
        let body = r#"{"title":"Song"}"#;
        let raw = format!(
            "POST /wares HTTP/1.1\r\nHost: h\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (mut action, _client) = action_for(&raw).await;
        let first = action.receive_content().await.unwrap();
        let second = action.receive_content().await.unwrap();
        assert_eq!(first, json!({"title": "Song"}));
        assert_eq!(first, second);

        #[derive(serde::Deserialize)]
        struct Ware {
            title: String,
        }
        let ware: Ware = action.content().await.unwrap();
        assert_eq!(ware.title, "Song");
    }

    #[tokio::test]
    async fn test_unchecked_fails_security() {
        let (action, _client) = action_for("GET /x HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(matches!(
            action.check_security(),
            Err(BtpError::SecurityRequired { .. })
        ));
    }
}
