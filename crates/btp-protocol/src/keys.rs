//! Public key resolution and caching.
//!
//! Verifying a BTP message needs the public key of the signing profile. A
//! [`KeyResolver`] answers `(user, profile) -> key`; the [`KeyCache`] keeps
//! recently used answers in front of a (usually remote) resolver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use btp_crypto::{ProfileId, UserId, VerifyingKey};

/// Default number of keys kept by a [`KeyCache`].
pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 100;

/// A resolved public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedKey {
    pub public_key: VerifyingKey,
    /// Whether the key may sign on behalf of users other than its owner.
    pub is_delegate: bool,
}

impl ResolvedKey {
    pub fn new(public_key: VerifyingKey, is_delegate: bool) -> Self {
        Self {
            public_key,
            is_delegate,
        }
    }
}

/// Looks up the public key of a user's profile.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Resolve a key, or `None` when it is unknown or cannot be fetched.
    async fn resolve(&self, user_id: UserId, profile_id: ProfileId) -> Option<ResolvedKey>;
}

// ============================================================================
// Static resolver
// ============================================================================

/// A resolver over keys pinned in memory.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: RwLock<HashMap<(UserId, ProfileId), ResolvedKey>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a key. Replaces any key already pinned for the profile.
    pub fn pin(&self, user_id: UserId, profile_id: ProfileId, key: ResolvedKey) {
        self.keys.write().insert((user_id, profile_id), key);
    }

    pub fn unpin(&self, user_id: UserId, profile_id: ProfileId) {
        self.keys.write().remove(&(user_id, profile_id));
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, user_id: UserId, profile_id: ProfileId) -> Option<ResolvedKey> {
        self.keys.read().get(&(user_id, profile_id)).copied()
    }
}

// ============================================================================
// Cache
// ============================================================================

struct CacheState {
    entries: LruCache<(UserId, ProfileId), ResolvedKey>,
    capacity: usize,
}

/// Bounded, least-recently-used cache of public keys.
///
/// Lookups that miss are forwarded to the attached resolver without holding
/// the cache lock; the answer is committed under a second short lock.
///
/// Lowering the capacity never evicts by itself. The cache is trimmed back
/// to its capacity on the next insert.
pub struct KeyCache {
    state: Mutex<CacheState>,
    resolver: RwLock<Option<Arc<dyn KeyResolver>>>,
}

impl KeyCache {
    /// Create a cache with no upstream resolver.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                capacity,
            }),
            resolver: RwLock::new(None),
        }
    }

    pub fn with_resolver(capacity: usize, resolver: Arc<dyn KeyResolver>) -> Self {
        let cache = Self::new(capacity);
        cache.set_resolver(Some(resolver));
        cache
    }

    /// Attach (or detach) the resolver consulted on misses.
    pub fn set_resolver(&self, resolver: Option<Arc<dyn KeyResolver>>) {
        *self.resolver.write() = resolver;
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Change the capacity. Existing entries are kept until the next insert.
    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a key is cached, without touching its recency.
    pub fn contains(&self, user_id: UserId, profile_id: ProfileId) -> bool {
        self.state.lock().entries.contains(&(user_id, profile_id))
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Insert a key as most recently used, then evict down to capacity.
    pub fn add_public_key(&self, user_id: UserId, profile_id: ProfileId, key: ResolvedKey) {
        let mut state = self.state.lock();
        state.entries.put((user_id, profile_id), key);
        while state.entries.len() > state.capacity {
            match state.entries.pop_lru() {
                Some(((evicted_user, evicted_profile), _)) => {
                    debug!(
                        user_id = evicted_user,
                        profile_id = evicted_profile,
                        "Evicted public key from cache"
                    );
                }
                None => break,
            }
        }
    }

    /// Look up a key, consulting the resolver on a miss.
    pub async fn get_public_key(
        &self,
        user_id: UserId,
        profile_id: ProfileId,
    ) -> Option<ResolvedKey> {
        let cached = {
            let mut state = self.state.lock();
            state.entries.get(&(user_id, profile_id)).copied()
        };
        if cached.is_some() {
            return cached;
        }

        let resolver = self.resolver.read().clone();
        let Some(resolver) = resolver else {
            debug!(user_id, profile_id, "Public key not cached and no resolver attached");
            return None;
        };

        debug!(user_id, profile_id, "Public key cache miss, resolving");
        let resolved = resolver.resolve(user_id, profile_id).await?;
        self.add_public_key(user_id, profile_id, resolved);
        Some(resolved)
    }
}

#[async_trait]
impl KeyResolver for KeyCache {
    async fn resolve(&self, user_id: UserId, profile_id: ProfileId) -> Option<ResolvedKey> {
        self.get_public_key(user_id, profile_id).await
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btp_crypto::Profile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        inner: StaticKeyResolver,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KeyResolver for CountingResolver {
        async fn resolve(&self, user_id: UserId, profile_id: ProfileId) -> Option<ResolvedKey> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(user_id, profile_id).await
        }
    }

    fn key() -> ResolvedKey {
        ResolvedKey::new(Profile::generate(1, 1).public_key(), false)
    }

    #[test]
    fn test_eviction_removes_least_recent() {
        let cache = KeyCache::new(3);
        cache.add_public_key(1, 1, key());
        cache.add_public_key(2, 1, key());
        cache.add_public_key(3, 1, key());
        cache.add_public_key(4, 1, key());

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(1, 1));
        assert!(cache.contains(2, 1));
        assert!(cache.contains(4, 1));
    }

    #[tokio::test]
    async fn test_access_promotes() {
        let cache = KeyCache::new(3);
        cache.add_public_key(1, 1, key());
        cache.add_public_key(2, 1, key());
        cache.add_public_key(3, 1, key());

        assert!(cache.get_public_key(1, 1).await.is_some());
        cache.add_public_key(4, 1, key());

        assert!(cache.contains(1, 1));
        assert!(!cache.contains(2, 1));
    }

    #[test]
    fn test_shrink_is_lazy() {
        let cache = KeyCache::new(4);
        for user in 1..=4 {
            cache.add_public_key(user, 1, key());
        }
        cache.set_capacity(2);
        assert_eq!(cache.len(), 4);

        cache.add_public_key(5, 1, key());
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(4, 1));
        assert!(cache.contains(5, 1));
    }

    #[tokio::test]
    async fn test_miss_goes_to_resolver_once() {
        let resolver = Arc::new(CountingResolver {
            inner: StaticKeyResolver::new(),
            calls: AtomicUsize::new(0),
        });
        let profile = Profile::generate(7, 2);
        resolver
            .inner
            .pin(7, 2, ResolvedKey::new(profile.public_key(), true));

        let cache = KeyCache::with_resolver(10, resolver.clone());
        let first = cache.get_public_key(7, 2).await.unwrap();
        let second = cache.get_public_key(7, 2).await.unwrap();

        assert_eq!(first, second);
        assert!(first.is_delegate);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_is_not_cached() {
        let cache = KeyCache::with_resolver(10, Arc::new(StaticKeyResolver::new()));
        assert!(cache.get_public_key(1, 1).await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_detach() {
        let cache = KeyCache::new(10);
        cache.add_public_key(1, 1, key());
        cache.clear();
        assert!(cache.get_public_key(1, 1).await.is_none());
    }
}
