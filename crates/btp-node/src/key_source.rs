//! Public key sources backing the node's key cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use btp_crypto::{public_key_from_hex, ProfileId, UserId};
use btp_protocol::{BtpError, BtpMessage, Client, KeyResolver, ResolvedKey};

/// Body of a key service answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    /// Hex-encoded verifying key.
    pub public_key: String,
    #[serde(default)]
    pub delegate: bool,
}

/// Path of a profile's key on the key service.
pub fn public_key_path(user_id: UserId, profile_id: ProfileId) -> String {
    format!("/api/3.0/users/keys/public/{user_id}/{profile_id}")
}

/// Fetches public keys from a key service.
///
/// The fetch itself is not verified with BTP signatures; over `https` the
/// service must present the certificate for `peer_id`'s identity name.
pub struct RemoteKeyResolver {
    client: Arc<Client>,
    base: Url,
    peer_id: UserId,
    timeout: Option<Duration>,
}

impl RemoteKeyResolver {
    pub fn new(client: Arc<Client>, base: Url, peer_id: UserId) -> Self {
        Self {
            client,
            base,
            peer_id,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn key_url(&self, user_id: UserId, profile_id: ProfileId) -> Result<Url, BtpError> {
        self.base
            .join(&public_key_path(user_id, profile_id))
            .map_err(|e| BtpError::Malformed(format!("bad key service url: {e}")))
    }

    /// Fetch and decode a key, reporting why it failed.
    pub async fn fetch(
        &self,
        user_id: UserId,
        profile_id: ProfileId,
    ) -> Result<ResolvedKey, BtpError> {
        let url = self.key_url(user_id, profile_id)?;
        let mut inbound = BtpMessage::new();
        self.client
            .exchange(
                self.peer_id,
                &url,
                &mut BtpMessage::new(),
                &mut inbound,
                self.timeout,
            )
            .await?;
        let record: PublicKeyRecord = inbound.content_object()?;
        let public_key = public_key_from_hex(&record.public_key)?;
        Ok(ResolvedKey::new(public_key, record.delegate))
    }
}

#[async_trait]
impl KeyResolver for RemoteKeyResolver {
    async fn resolve(&self, user_id: UserId, profile_id: ProfileId) -> Option<ResolvedKey> {
        match self.fetch(user_id, profile_id).await {
            Ok(key) => {
                debug!(user_id, profile_id, delegate = key.is_delegate, "Fetched public key");
                Some(key)
            }
            Err(e) => {
                warn!(user_id, profile_id, error = %e, "Could not fetch public key");
                None
            }
        }
    }
}

impl std::fmt::Debug for RemoteKeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteKeyResolver")
            .field("base", &self.base.as_str())
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Consults resolvers in order; the first answer wins.
#[derive(Default)]
pub struct ChainedKeyResolver {
    resolvers: Vec<Arc<dyn KeyResolver>>,
}

impl ChainedKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl KeyResolver for ChainedKeyResolver {
    async fn resolve(&self, user_id: UserId, profile_id: ProfileId) -> Option<ResolvedKey> {
        for resolver in &self.resolvers {
            if let Some(key) = resolver.resolve(user_id, profile_id).await {
                return Some(key);
            }
        }
        None
    }
}
