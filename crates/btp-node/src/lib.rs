//! btp-node: a BTP node.
//!
//! Provides:
//! - A single listener serving plain and TLS connections, chosen per
//!   connection from the first byte
//! - A service registry keyed by domain, path and scheme
//! - TLS virtual hosts named after the users a node hosts
//! - The node context shared by server, messenger and key lookups
//! - Remote public key resolution through a key service

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod errors;
pub mod key_source;
pub mod messenger;
pub mod server;
pub mod status;
pub mod tls;

pub use config::{ConfigError, NodeConfig};
pub use context::{NodeContext, NodeProfiles, KEY_SERVICE_USER_ID};
pub use errors::{Result, ServerError};
pub use key_source::{ChainedKeyResolver, PublicKeyRecord, RemoteKeyResolver};
pub use messenger::{Messenger, RequestOptions};
pub use server::{BtpServer, ServiceMode, ANY_DOMAIN};
pub use status::{status_service, NodeStatus, STATUS_SERVICE_PATH};
pub use tls::{CertificateAuthority, TlsIdentity, VirtualHostResolver};

#[cfg(test)]
mod proptests;
