use proptest::prelude::*;

use btp_crypto::Profile;

use crate::keys::{KeyCache, ResolvedKey};
use crate::service::normalize_path;

fn key() -> ResolvedKey {
    ResolvedKey::new(Profile::from_seed(1, 1, &[7u8; 32]).public_key(), false)
}

proptest! {
    #[test]
    fn prop_cache_never_exceeds_capacity(
        capacity in 1usize..16,
        inserts in prop::collection::vec((0u64..32, 0u64..4), 1..64),
    ) {
        let cache = KeyCache::new(capacity);
        for (user, profile) in inserts {
            cache.add_public_key(user, profile, key());
            prop_assert!(cache.len() <= capacity);
        }
    }

    #[test]
    fn prop_touched_key_survives_next_eviction(capacity in 2usize..12) {
        let cache = KeyCache::new(capacity);
        for user in 0..capacity as u64 {
            cache.add_public_key(user, 1, key());
        }
        prop_assert!(tokio_test::block_on(cache.get_public_key(0, 1)).is_some());

        cache.add_public_key(capacity as u64, 1, key());
        prop_assert!(cache.contains(0, 1));
        prop_assert!(!cache.contains(1, 1));
    }

    #[test]
    fn prop_normalize_is_idempotent(path in "[a-z/]{0,24}") {
        let once = normalize_path(&path);
        prop_assert!(once.starts_with('/'));
        prop_assert_eq!(normalize_path(&once), once);
    }
}
