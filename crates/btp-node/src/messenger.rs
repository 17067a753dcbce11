//! Typed request helpers over the node's client.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use btp_crypto::UserId;
use btp_protocol::http::HttpHeader;
use btp_protocol::{codec, BtpError, BtpMessage, HeaderValue, MessageKind};

use crate::context::NodeContext;

/// Who a request is sent as.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Sign as this hosted user. `None` signs as the node itself.
    pub as_user: Option<UserId>,
    /// Send the request unsigned and do not verify the response.
    pub anonymous: bool,
    /// Expected TLS identity of the peer, 0 for the URL host.
    pub peer_id: UserId,
    pub headers: Vec<(String, HeaderValue)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            ..Self::default()
        }
    }

    pub fn as_user(user_id: UserId) -> Self {
        Self {
            as_user: Some(user_id),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

/// The peer a request addresses: `nodeuser` in the query overrides `peer_id`.
fn target_peer(url: &Url, peer_id: UserId) -> UserId {
    url.query_pairs()
        .find(|(key, _)| key == "nodeuser")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(peer_id)
}

/// Sends signed requests as the node or one of its hosted users.
#[derive(Debug, Clone)]
pub struct Messenger {
    context: Arc<NodeContext>,
}

impl Messenger {
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    /// Exchange prepared messages, binding signing and verification per
    /// `options`.
    pub async fn exchange(
        &self,
        url: &Url,
        out: &mut BtpMessage,
        inbound: &mut BtpMessage,
        options: &RequestOptions,
    ) -> Result<HttpHeader, BtpError> {
        if !options.anonymous {
            let user = options.as_user.unwrap_or(self.context.user_id());
            let profile = self.context.profiles().get(user).ok_or_else(|| {
                BtpError::action(
                    "bitmunk.node.Messenger.NotLoggedIn",
                    format!("no profile for user {user} on this node"),
                    0,
                )
            })?;
            out.set_signer(Some(profile));
            inbound.set_key_resolver(Some(self.context.key_resolver()));
        }
        for (name, value) in &options.headers {
            out.custom_headers_mut().set(name, value.clone());
        }

        let peer_id = target_peer(url, options.peer_id);
        debug!(url = %url, method = %out.kind(), peer_id, "Sending BTP request");
        self.context
            .client()
            .exchange(peer_id, url, out, inbound, options.timeout)
            .await
    }

    async fn request<R: DeserializeOwned>(
        &self,
        kind: MessageKind,
        url: &Url,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> Result<R, BtpError> {
        let mut out = BtpMessage::with_kind(kind);
        if let Some(body) = body {
            out.set_content_value(body);
        }
        let mut inbound = BtpMessage::new();
        self.exchange(url, &mut out, &mut inbound, options).await?;
        codec::from_value(inbound.take_content_value().unwrap_or(Value::Null))
    }

    pub async fn get<R: DeserializeOwned>(
        &self,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<R, BtpError> {
        self.request(MessageKind::Get, url, None, options).await
    }

    pub async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &Url,
        body: &B,
        options: &RequestOptions,
    ) -> Result<R, BtpError> {
        let body = codec::to_value(body)?;
        self.request(MessageKind::Post, url, Some(body), options).await
    }

    pub async fn put<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &Url,
        body: &B,
        options: &RequestOptions,
    ) -> Result<R, BtpError> {
        let body = codec::to_value(body)?;
        self.request(MessageKind::Put, url, Some(body), options).await
    }

    pub async fn delete<R: DeserializeOwned>(
        &self,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<R, BtpError> {
        self.request(MessageKind::Delete, url, None, options).await
    }
}
