//! Resource handlers and their authentication policies.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use btp_crypto::{Profile, UserId};

use crate::action::Action;
use crate::errors::{BtpError, Result};
use crate::keys::KeyResolver;

/// How a handler authenticates its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPolicy {
    /// Verify the request only if it carries a security claim.
    #[default]
    Optional,
    /// As `Optional`, but only over TLS.
    OptionalWithTls,
    /// TLS and a valid security claim are required before the handler runs.
    Required,
}

impl AuthPolicy {
    pub fn requires_secure_connection(self) -> bool {
        matches!(self, AuthPolicy::OptionalWithTls | AuthPolicy::Required)
    }
}

/// Profiles a node can sign responses as.
pub trait ResponderProfiles: Send + Sync {
    /// The profile for `user_id`, or the node's default responder for `None`.
    fn responder(&self, user_id: Option<UserId>) -> Option<Arc<Profile>>;
}

/// What the server needs to verify requests and sign responses.
#[derive(Clone, Default)]
pub struct SecurityContext {
    pub key_resolver: Option<Arc<dyn KeyResolver>>,
    pub responders: Option<Arc<dyn ResponderProfiles>>,
}

impl SecurityContext {
    pub fn new(
        key_resolver: Arc<dyn KeyResolver>,
        responders: Arc<dyn ResponderProfiles>,
    ) -> Self {
        Self {
            key_resolver: Some(key_resolver),
            responders: Some(responders),
        }
    }

    fn responder(&self, user_id: Option<UserId>) -> Option<Arc<Profile>> {
        self.responders.as_ref().and_then(|r| r.responder(user_id))
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("key_resolver", &self.key_resolver.is_some())
            .field("responders", &self.responders.is_some())
            .finish()
    }
}

/// Application logic bound to a resource.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy::Optional
    }

    /// Cheap authorization check run before [`ActionHandler::perform_action`].
    async fn can_perform_action(&self, _action: &mut Action) -> Result<()> {
        Ok(())
    }

    /// Service the action. Should complete it with a result; an `Err` is
    /// sent to the caller as an exception.
    async fn perform_action(&self, action: &mut Action) -> Result<()>;
}

/// Enforce `handler`'s policy and run its pre-check.
///
/// A request whose head was already verified is not verified again.
pub async fn authorize(
    handler: &dyn ActionHandler,
    action: &mut Action,
    security: &SecurityContext,
) -> Result<()> {
    let policy = handler.auth_policy();
    if policy.requires_secure_connection() && !action.is_secure() {
        return Err(BtpError::SecureConnectionRequired {
            resource: action.resource().to_string(),
        });
    }

    let claimed = action.has_security_claim();
    if policy == AuthPolicy::Required && !claimed {
        return Err(BtpError::SecurityRequired {
            resource: action.resource().to_string(),
            method: action.in_message().kind().to_string(),
        });
    }

    if policy == AuthPolicy::Required || claimed {
        if !action.is_security_checked() {
            let status = action
                .check_header_security(security.key_resolver.clone())
                .await;
            debug!(resource = %action.resource(), ?status, "Checked request security");

            let node_user = action.node_user();
            match security.responder(node_user) {
                Some(profile) => action.set_responder(Some(profile)),
                None => {
                    return Err(BtpError::SecureResourceNotAvailable {
                        resource: action.resource().to_string(),
                    })
                }
            }
        }
        action.check_security()?;
    }

    handler.can_perform_action(action).await
}

/// Enforce `handler`'s policy, then run it.
///
/// Errors are returned without being sent; the caller completes the action
/// with them.
pub async fn run_handler(
    handler: &dyn ActionHandler,
    action: &mut Action,
    security: &SecurityContext,
) -> Result<()> {
    authorize(handler, action, security).await?;
    handler.perform_action(action).await
}

/// Run `handler` and complete the action with any error it returns.
pub async fn handle_action(
    handler: &dyn ActionHandler,
    action: &mut Action,
    security: &SecurityContext,
) -> Result<()> {
    match run_handler(handler, action, security).await {
        Ok(()) => {
            if !action.is_result_sent() {
                action.send_result().await?;
            }
            Ok(())
        }
        Err(e) => {
            let client = e.is_client_error();
            action.send_exception(&e, client).await
        }
    }
}
