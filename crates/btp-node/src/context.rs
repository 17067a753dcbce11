//! Shared state of a running node.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use btp_crypto::{Profile, ProfileId, UserId};
use btp_protocol::{
    Client, KeyCache, KeyResolver, ResolvedKey, ResponderProfiles, SecurityContext,
    StaticKeyResolver,
};

use crate::config::{ConfigError, NodeConfig};
use crate::errors::{Result, ServerError};
use crate::key_source::{ChainedKeyResolver, RemoteKeyResolver};

/// User id of the key service's TLS identity.
pub const KEY_SERVICE_USER_ID: UserId = 1;

/// Profiles the node signs responses with, keyed by user.
#[derive(Debug)]
pub struct NodeProfiles {
    default_user: UserId,
    profiles: RwLock<HashMap<UserId, Arc<Profile>>>,
}

impl NodeProfiles {
    pub fn new(default: Arc<Profile>) -> Self {
        let default_user = default.user_id();
        let mut profiles = HashMap::new();
        profiles.insert(default_user, default);
        Self {
            default_user,
            profiles: RwLock::new(profiles),
        }
    }

    pub fn default_user(&self) -> UserId {
        self.default_user
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<Profile>> {
        self.profiles.read().get(&user_id).cloned()
    }

    pub fn insert(&self, profile: Arc<Profile>) -> Option<Arc<Profile>> {
        self.profiles.write().insert(profile.user_id(), profile)
    }

    /// Remove a user's profile. The default profile stays.
    pub fn remove(&self, user_id: UserId) -> Option<Arc<Profile>> {
        if user_id == self.default_user {
            return None;
        }
        self.profiles.write().remove(&user_id)
    }

    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.profiles.read().keys().copied().collect();
        users.sort_unstable();
        users
    }
}

impl ResponderProfiles for NodeProfiles {
    fn responder(&self, user_id: Option<UserId>) -> Option<Arc<Profile>> {
        self.get(user_id.unwrap_or(self.default_user))
    }
}

/// Everything a node's server, messenger and key lookups share.
///
/// Built once at startup and passed around by `Arc`.
pub struct NodeContext {
    config: NodeConfig,
    profile: Arc<Profile>,
    profiles: Arc<NodeProfiles>,
    local_keys: Arc<StaticKeyResolver>,
    key_cache: Arc<KeyCache>,
    client: Arc<Client>,
}

impl NodeContext {
    /// Build a context with the profile described by `config`.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let profile = config.load_profile()?;
        Self::with_profile(config, profile)
    }

    /// Build a context signing as `profile`.
    pub fn with_profile(config: NodeConfig, profile: Profile) -> Result<Arc<Self>> {
        let client = Arc::new(Client::new(config.to_client_config()?)?);

        let local_keys = Arc::new(StaticKeyResolver::new());
        let mut resolver = ChainedKeyResolver::new().push(local_keys.clone());
        if let Some(base) = config.key_service_url()? {
            info!(url = %base, "Resolving unknown public keys with key service");
            let remote = RemoteKeyResolver::new(client.clone(), base, KEY_SERVICE_USER_ID)
                .with_timeout(config.io_timeout());
            resolver = resolver.push(Arc::new(remote));
        }
        let key_cache = Arc::new(KeyCache::with_resolver(
            config.key_cache_capacity,
            Arc::new(resolver),
        ));

        let profile = Arc::new(profile);
        if profile.user_id() != config.user_id {
            return Err(ServerError::Config(ConfigError::Invalid(format!(
                "profile user {} does not match configured user {}",
                profile.user_id(),
                config.user_id
            ))));
        }
        let context = Self {
            profiles: Arc::new(NodeProfiles::new(profile.clone())),
            profile: profile.clone(),
            config,
            local_keys,
            key_cache,
            client,
        };
        context.pin_profile_key(&profile);
        Ok(Arc::new(context))
    }

    fn pin_profile_key(&self, profile: &Profile) {
        self.local_keys.pin(
            profile.user_id(),
            profile.profile_id(),
            ResolvedKey::new(profile.public_key(), false),
        );
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn user_id(&self) -> UserId {
        self.profiles.default_user()
    }

    /// The node's own profile.
    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    pub fn profiles(&self) -> &Arc<NodeProfiles> {
        &self.profiles
    }

    /// Host another user's profile: sign responses as it and trust its key.
    pub fn add_profile(&self, profile: Profile) -> Arc<Profile> {
        let profile = Arc::new(profile);
        self.pin_profile_key(&profile);
        self.profiles.insert(profile.clone());
        info!(user_id = profile.user_id(), "Added node profile");
        profile
    }

    pub fn remove_profile(&self, user_id: UserId) -> Option<Arc<Profile>> {
        let removed = self.profiles.remove(user_id)?;
        self.local_keys.unpin(removed.user_id(), removed.profile_id());
        self.key_cache.clear();
        info!(user_id, "Removed node profile");
        Some(removed)
    }

    /// Pin a peer's key so it never needs a remote lookup.
    pub fn trust_key(&self, user_id: UserId, profile_id: ProfileId, key: ResolvedKey) {
        self.local_keys.pin(user_id, profile_id, key);
    }

    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.key_cache
    }

    pub fn key_resolver(&self) -> Arc<dyn KeyResolver> {
        self.key_cache.clone()
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// What services need to verify requests and sign responses.
    pub fn security_context(&self) -> SecurityContext {
        SecurityContext::new(self.key_resolver(), self.profiles.clone())
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("user_id", &self.user_id())
            .field("profiles", &self.profiles.users())
            .field("cached_keys", &self.key_cache.len())
            .finish()
    }
}
