//! Node status resource.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use btp_crypto::{ProfileId, UserId};
use btp_protocol::{
    Action, ActionHandler, BtpService, MessageKind, Params, RestResourceHandler, Result,
    SecurityStatus,
};

use crate::context::NodeContext;

/// Path the status service is mounted at.
pub const STATUS_SERVICE_PATH: &str = "/api/3.0/status";

/// What `GET /api/3.0/status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub user_id: UserId,
    pub profile_id: ProfileId,
    /// Hex-encoded public key of the node profile.
    pub public_key: String,
    pub hosted_users: Vec<UserId>,
    pub uptime_secs: u64,
    /// Whether the caller's request passed a signature check.
    pub caller_verified: bool,
}

pub struct StatusHandler {
    context: Arc<NodeContext>,
    started: Instant,
}

impl StatusHandler {
    pub fn new(context: Arc<NodeContext>) -> Self {
        Self {
            context,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl ActionHandler for StatusHandler {
    async fn perform_action(&self, action: &mut Action) -> Result<()> {
        let profile = self.context.profile();
        let status = NodeStatus {
            user_id: profile.user_id(),
            profile_id: profile.profile_id(),
            public_key: profile.public_key_hex(),
            hosted_users: self.context.profiles().users(),
            uptime_secs: self.started.elapsed().as_secs(),
            caller_verified: action.in_message().security_status() == SecurityStatus::Secure,
        };
        action.send_result_object(&status).await
    }
}

/// The status service, secured with the node's keys and profiles.
///
/// Only `GET` with no resource parameters is served.
pub fn status_service(context: &Arc<NodeContext>) -> BtpService {
    let security = context.security_context();
    let mut status = RestResourceHandler::new(security.clone());
    status.add_handler(
        MessageKind::Get,
        Params::Exactly(0),
        Arc::new(StatusHandler::new(context.clone())),
    );

    let mut service = BtpService::new(STATUS_SERVICE_PATH, security);
    service.set_allow_http1(context.config().allow_http1);
    service.add_resource("/", Arc::new(status));
    service
}
