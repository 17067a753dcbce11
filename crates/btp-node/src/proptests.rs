use std::sync::Arc;

use proptest::prelude::*;

use btp_crypto::Profile;
use btp_protocol::{normalize_path, BtpService, SecurityContext};

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::server::{host_domain, path_and_parents, BtpServer, ServiceMode};

fn plain_server() -> BtpServer {
    let config = NodeConfig {
        user_id: 9,
        ..NodeConfig::default()
    };
    let context = NodeContext::with_profile(config, Profile::from_seed(9, 1, &[3u8; 32])).unwrap();
    BtpServer::with_identity(context, None).unwrap()
}

proptest! {
    #[test]
    fn prop_parents_end_at_root(path in "(/[a-z0-9]{1,6}){0,6}") {
        let path = normalize_path(&path);
        let chain: Vec<&str> = path_and_parents(&path).collect();
        prop_assert_eq!(chain.last().copied(), Some("/"));
        for pair in chain.windows(2) {
            prop_assert!(pair[0].starts_with(pair[1]));
            prop_assert!(pair[0].len() > pair[1].len());
        }
    }

    #[test]
    fn prop_host_port_is_ignored(domain in "[a-z]{1,10}(\\.[a-z]{1,6}){0,2}", port in 1u16..=65535) {
        prop_assert_eq!(host_domain(&format!("{domain}:{port}")), domain.clone());
        prop_assert_eq!(host_domain(&domain.to_uppercase()), domain);
    }

    #[test]
    fn prop_failed_add_leaves_registry_unchanged(
        paths in prop::collection::vec("/[a-c]{1,2}", 1..12),
    ) {
        let server = plain_server();
        let mut registered = std::collections::HashSet::new();
        for path in paths {
            let service = Arc::new(BtpService::new(&path, SecurityContext::default()));
            let before = server.service_count();
            let added = server.add_service(service, ServiceMode::PlainOnly, &[]).is_ok();
            prop_assert_eq!(added, registered.insert(path.clone()));
            prop_assert_eq!(server.service_count(), before + usize::from(added));
        }
        for path in &registered {
            prop_assert!(server.remove_service(path, ServiceMode::PlainOnly, &[]).is_some());
        }
        prop_assert_eq!(server.service_count(), 0);
    }
}
