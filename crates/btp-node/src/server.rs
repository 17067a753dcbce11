//! BTP server: one listener, TLS sniffing, and the service registry.
//!
//! Every accepted connection is inspected before anything is read from it.
//! A TLS handshake record goes through the acceptor, anything else is served
//! as plain HTTP. The request is then routed by `Host` domain, path and
//! whether the connection is secure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use btp_crypto::{user_common_name, UserId};
use btp_protocol::http::{names, BandwidthThrottler, HttpConnection, HttpHeader};
use btp_protocol::{normalize_path, Action, BtpError, BtpService};

use crate::context::NodeContext;
use crate::errors::{Result, ServerError};
use crate::tls::{server_tls_config, TlsIdentity, VirtualHostResolver};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// Domain matching any `Host`.
pub const ANY_DOMAIN: &str = "*";

/// Which connections a service is offered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    SecureOnly,
    PlainOnly,
    Both,
}

impl ServiceMode {
    fn secure_flags(self) -> &'static [bool] {
        match self {
            ServiceMode::SecureOnly => &[true],
            ServiceMode::PlainOnly => &[false],
            ServiceMode::Both => &[true, false],
        }
    }

    fn needs_tls(self) -> bool {
        self != ServiceMode::PlainOnly
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    domain: String,
    path: String,
    secure: bool,
}

/// The domain part of a `Host` value, lowercased.
pub(crate) fn host_domain(host: &str) -> String {
    let host = host.trim();
    let domain = match host.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => match host.rsplit_once(':') {
            Some((domain, port)) if port.chars().all(|c| c.is_ascii_digit()) => domain,
            _ => host,
        },
    };
    domain.to_ascii_lowercase()
}

/// `path` and each of its parents, nearest first.
pub(crate) fn path_and_parents(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(path), |&p| match p.rfind('/') {
        _ if p.len() <= 1 => None,
        Some(0) => Some("/"),
        Some(i) => Some(&p[..i]),
        None => None,
    })
}

fn domain_list(domains: &[&str]) -> Vec<String> {
    if domains.is_empty() {
        vec![ANY_DOMAIN.to_string()]
    } else {
        domains.iter().map(|d| d.to_ascii_lowercase()).collect()
    }
}

/// Serves registered BTP services over plain and TLS connections.
pub struct BtpServer {
    context: Arc<NodeContext>,
    services: RwLock<HashMap<ServiceKey, Arc<BtpService>>>,
    virtual_hosts: Option<Arc<VirtualHostResolver>>,
    acceptor: Option<TlsAcceptor>,
    io_timeout: Duration,
    read_throttler: Option<Arc<BandwidthThrottler>>,
    write_throttler: Option<Arc<BandwidthThrottler>>,
    shutdown: watch::Sender<bool>,
}

impl BtpServer {
    /// Create a server using the certificate configured for the node,
    /// generating one first if the configuration asks for it.
    pub fn new(context: Arc<NodeContext>) -> Result<Self> {
        let config = context.config();
        let identity = TlsIdentity::load_or_generate(
            &user_common_name(context.user_id()),
            &config.tls_cert_path,
            &config.tls_key_path,
            config.tls_generate,
        )?;
        Self::with_identity(context, Some(identity))
    }

    /// Create a server presenting `identity`, or a plain-only server.
    pub fn with_identity(context: Arc<NodeContext>, identity: Option<TlsIdentity>) -> Result<Self> {
        let (virtual_hosts, acceptor) = match identity {
            Some(identity) => {
                let name = user_common_name(context.user_id());
                let resolver = Arc::new(VirtualHostResolver::new(name, identity.certified_key()?));
                let tls = server_tls_config(resolver.clone())?;
                (Some(resolver), Some(TlsAcceptor::from(tls)))
            }
            None => (None, None),
        };
        let config = context.config();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            io_timeout: config.io_timeout(),
            read_throttler: config.read_throttler(),
            write_throttler: config.write_throttler(),
            context,
            services: RwLock::new(HashMap::new()),
            virtual_hosts,
            acceptor,
            shutdown,
        })
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    // ------------------------------------------------------------------
    // Service registry
    // ------------------------------------------------------------------

    /// Register `service` under its path for each of `domains` (any domain
    /// when empty). Either every registration succeeds or none is made.
    pub fn add_service(
        &self,
        service: Arc<BtpService>,
        mode: ServiceMode,
        domains: &[&str],
    ) -> Result<()> {
        let path = service.path().to_string();
        if mode.needs_tls() && !self.is_tls_enabled() {
            return Err(ServerError::SecureUnavailable { path });
        }

        let keys: Vec<ServiceKey> = domain_list(domains)
            .into_iter()
            .flat_map(|domain| {
                let path = path.clone();
                mode.secure_flags().iter().map(move |&secure| ServiceKey {
                    domain: domain.clone(),
                    path: path.clone(),
                    secure,
                })
            })
            .collect();

        let mut services = self.services.write();
        if let Some(taken) = keys.iter().find(|key| services.contains_key(*key)) {
            warn!(
                domain = %taken.domain,
                path = %taken.path,
                secure = taken.secure,
                "BTP service already registered"
            );
            return Err(ServerError::ServiceConflict {
                domain: taken.domain.clone(),
                path: taken.path.clone(),
                secure: taken.secure,
            });
        }
        for key in keys {
            services.insert(key, service.clone());
        }
        info!(path = %path, ?mode, ?domains, "Added BTP service");
        Ok(())
    }

    /// Unregister the service at `path`. Removing something that is not
    /// registered is a no-op.
    pub fn remove_service(
        &self,
        path: &str,
        mode: ServiceMode,
        domains: &[&str],
    ) -> Option<Arc<BtpService>> {
        let path = normalize_path(path);
        let mut services = self.services.write();
        let mut removed = None;
        for domain in domain_list(domains) {
            for &secure in mode.secure_flags() {
                let key = ServiceKey {
                    domain: domain.clone(),
                    path: path.clone(),
                    secure,
                };
                if let Some(service) = services.remove(&key) {
                    removed = Some(service);
                }
            }
        }
        if removed.is_some() {
            info!(path = %path, ?mode, "Removed BTP service");
        }
        removed
    }

    /// The service registered exactly at `domain`, `path` and scheme.
    pub fn get_service(&self, domain: &str, path: &str, secure: bool) -> Option<Arc<BtpService>> {
        let key = ServiceKey {
            domain: domain.to_ascii_lowercase(),
            path: normalize_path(path),
            secure,
        };
        self.services.read().get(&key).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    /// The service answering a request for `host` and `path`.
    ///
    /// The nearest registered parent path wins; an exact domain is preferred
    /// over [`ANY_DOMAIN`] at the same path.
    pub fn find_service(&self, host: &str, path: &str, secure: bool) -> Option<Arc<BtpService>> {
        let domain = host_domain(host);
        let normalized = normalize_path(path);
        let path = normalized
            .split_once('?')
            .map_or(normalized.as_str(), |(p, _)| p);
        let services = self.services.read();
        for candidate in path_and_parents(path) {
            for domain in [domain.as_str(), ANY_DOMAIN] {
                let key = ServiceKey {
                    domain: domain.to_string(),
                    path: candidate.to_string(),
                    secure,
                };
                if let Some(service) = services.get(&key) {
                    return Some(service.clone());
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Virtual hosts
    // ------------------------------------------------------------------

    /// Serve `identity` to clients that ask for `user_id`'s identity name.
    pub fn add_virtual_host(&self, user_id: UserId, identity: &TlsIdentity) -> Result<()> {
        let hosts = self.virtual_hosts.as_ref().ok_or_else(|| ServerError::SecureUnavailable {
            path: user_common_name(user_id),
        })?;
        let key = identity.certified_key()?;
        hosts.add(&user_common_name(user_id), key);
        Ok(())
    }

    pub fn remove_virtual_host(&self, user_id: UserId) -> bool {
        self.virtual_hosts
            .as_ref()
            .and_then(|hosts| hosts.remove(&user_common_name(user_id)))
            .is_some()
    }

    pub fn has_virtual_host(&self, user_id: UserId) -> bool {
        self.virtual_hosts
            .as_ref()
            .is_some_and(|hosts| hosts.contains(&user_common_name(user_id)))
    }

    // ------------------------------------------------------------------
    // Serving
    // ------------------------------------------------------------------

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.context.config().listen_addr;
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Accept connections until [`BtpServer::shutdown`] is called.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            addr = ?listener.local_addr().ok(),
            tls = self.is_tls_enabled(),
            "Serving BTP"
        );
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_connection(tcp, peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.changed() => {}
            }
        }
        info!("BTP server stopped");
        Ok(())
    }

    /// Stop accepting connections. In-flight requests finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn serve_connection(&self, tcp: TcpStream, peer: SocketAddr) {
        let _ = tcp.set_nodelay(true);
        let mut first = [0u8; 1];
        match tokio::time::timeout(self.io_timeout, tcp.peek(&mut first)).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) => return,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Connection failed before first byte");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "Connection idle before first byte");
                return;
            }
        }

        let conn = if first[0] == TLS_HANDSHAKE {
            let Some(acceptor) = &self.acceptor else {
                debug!(peer = %peer, "TLS connection refused, no certificate configured");
                return;
            };
            match tokio::time::timeout(self.io_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => HttpConnection::new(stream, true),
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "TLS handshake timed out");
                    return;
                }
            }
        } else {
            HttpConnection::new(tcp, false)
        };

        let mut conn = conn.with_peer_addr(peer);
        conn.set_timeouts(self.io_timeout, self.io_timeout);
        conn.set_read_throttler(self.read_throttler.clone());
        conn.set_write_throttler(self.write_throttler.clone());

        let request = match conn.receive_header().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Could not read request header");
                return;
            }
        };
        if let Err(e) = self.dispatch(conn, request).await {
            debug!(peer = %peer, error = %e, "BTP request ended with error");
        }
    }

    async fn dispatch(&self, conn: HttpConnection, request: HttpHeader) -> Result<()> {
        let host = request.get(names::HOST).unwrap_or_default().to_string();
        let path = request.path().unwrap_or("/").to_string();
        let secure = conn.is_secure();

        match self.find_service(&host, &path, secure) {
            Some(service) => service.service_request(conn, request).await?,
            None => {
                debug!(host = %host, path = %path, secure, "No BTP service for request");
                let error = BtpError::NoMatchingService {
                    domain: host_domain(&host),
                    path: normalize_path(&path),
                };
                let mut action = Action::new(conn, request, normalize_path(&path));
                let result = action.send_exception(&error, true).await;
                let _ = action.into_connection().shutdown().await;
                result?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BtpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtpServer")
            .field("tls", &self.is_tls_enabled())
            .field("services", &self.service_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use btp_crypto::Profile;
    use btp_protocol::SecurityContext;

    fn context() -> Arc<NodeContext> {
        let config = NodeConfig {
            user_id: 100,
            ..NodeConfig::default()
        };
        NodeContext::with_profile(config, Profile::generate(100, 1)).unwrap()
    }

    fn tls_server() -> BtpServer {
        let identity = TlsIdentity::self_signed("bitmunk-100").unwrap();
        BtpServer::with_identity(context(), Some(identity)).unwrap()
    }

    fn service(path: &str) -> Arc<BtpService> {
        Arc::new(BtpService::new(path, SecurityContext::default()))
    }

    #[test]
    fn test_host_domain() {
        assert_eq!(host_domain("Example.com:8200"), "example.com");
        assert_eq!(host_domain("example.com"), "example.com");
        assert_eq!(host_domain("[::1]:80"), "::1");
        assert_eq!(host_domain(""), "");
    }

    #[test]
    fn test_path_and_parents() {
        let all: Vec<_> = path_and_parents("/a/b/c").collect();
        assert_eq!(all, vec!["/a/b/c", "/a/b", "/a", "/"]);
        assert_eq!(path_and_parents("/").collect::<Vec<_>>(), vec!["/"]);
    }

    #[test]
    fn test_modes_register_by_scheme() {
        let server = tls_server();
        server
            .add_service(service("/api/3.0"), ServiceMode::Both, &[])
            .unwrap();
        assert_eq!(server.service_count(), 2);
        assert!(server.get_service("*", "/api/3.0", true).is_some());
        assert!(server.get_service("*", "/api/3.0/", false).is_some());

        server
            .add_service(service("/secure"), ServiceMode::SecureOnly, &[])
            .unwrap();
        assert!(server.find_service("h", "/secure/x", true).is_some());
        assert!(server.find_service("h", "/secure/x", false).is_none());
    }

    #[test]
    fn test_conflict_rolls_back() {
        let server = tls_server();
        server
            .add_service(service("/api"), ServiceMode::PlainOnly, &["b.example"])
            .unwrap();

        let err = server
            .add_service(service("/api"), ServiceMode::Both, &["a.example", "b.example"])
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::ServiceConflict { ref domain, secure: false, .. } if domain == "b.example"
        ));
        // Nothing from the failed call was kept
        assert_eq!(server.service_count(), 1);
        assert!(server.get_service("a.example", "/api", true).is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let server = tls_server();
        let svc = service("/api");
        server
            .add_service(svc.clone(), ServiceMode::Both, &[])
            .unwrap();
        let removed = server
            .remove_service("/api", ServiceMode::SecureOnly, &[])
            .unwrap();
        assert!(Arc::ptr_eq(&removed, &svc));
        assert!(server.remove_service("/api", ServiceMode::SecureOnly, &[]).is_none());
        assert!(server.get_service("*", "/api", false).is_some());
    }

    #[test]
    fn test_exact_domain_preferred() {
        let server = tls_server();
        let any = service("/api");
        let exact = service("/api");
        server.add_service(any.clone(), ServiceMode::PlainOnly, &[]).unwrap();
        server
            .add_service(exact.clone(), ServiceMode::PlainOnly, &["node.example"])
            .unwrap();

        let found = server.find_service("NODE.example:8200", "/api/x?y=1", false).unwrap();
        assert!(Arc::ptr_eq(&found, &exact));
        let found = server.find_service("other", "/api", false).unwrap();
        assert!(Arc::ptr_eq(&found, &any));
    }

    #[test]
    fn test_plain_server_refuses_secure_services() {
        let server = BtpServer::with_identity(context(), None).unwrap();
        assert!(matches!(
            server.add_service(service("/api"), ServiceMode::Both, &[]),
            Err(ServerError::SecureUnavailable { .. })
        ));
        server
            .add_service(service("/api"), ServiceMode::PlainOnly, &[])
            .unwrap();
        let identity = TlsIdentity::self_signed("bitmunk-7").unwrap();
        assert!(server.add_virtual_host(7, &identity).is_err());
    }

    #[test]
    fn test_virtual_hosts() {
        let server = tls_server();
        let identity = TlsIdentity::self_signed("bitmunk-7").unwrap();
        server.add_virtual_host(7, &identity).unwrap();
        assert!(server.has_virtual_host(7));
        assert!(server.remove_virtual_host(7));
        assert!(!server.remove_virtual_host(7));
    }
}
