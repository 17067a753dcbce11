//! A path-rooted collection of resource handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::action::{Action, SERVER_NAME};
use crate::errors::{BtpError, Result};
use crate::handler::{handle_action, ActionHandler, SecurityContext};
use crate::http::{names, BandwidthThrottler, HttpConnection, HttpHeader, HttpVersion};

/// Normalize a request path: leading slash, no repeated or trailing slashes.
///
/// A query, if present, is kept as is.
pub fn normalize_path(path: &str) -> String {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}

/// The parent of a normalized path, `None` for the root.
fn parent_path(path: &str) -> Option<&str> {
    if path.len() <= 1 {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Services requests under one path.
pub struct BtpService {
    path: String,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    security: SecurityContext,
    read_throttler: Option<Arc<BandwidthThrottler>>,
    write_throttler: Option<Arc<BandwidthThrottler>>,
    allow_http1: bool,
}

impl BtpService {
    pub fn new(path: &str, security: SecurityContext) -> Self {
        Self {
            path: normalize_path(path),
            handlers: RwLock::new(HashMap::new()),
            security,
            read_throttler: None,
            write_throttler: None,
            allow_http1: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Also accept HTTP/1.0 requests.
    pub fn set_allow_http1(&mut self, allow: bool) {
        self.allow_http1 = allow;
    }

    pub fn set_throttlers(
        &mut self,
        read: Option<Arc<BandwidthThrottler>>,
        write: Option<Arc<BandwidthThrottler>>,
    ) {
        self.read_throttler = read;
        self.write_throttler = write;
    }

    fn full_path(&self, resource: &str) -> String {
        normalize_path(&format!("{}/{}", self.path, resource))
    }

    /// Bind `handler` to `resource`, relative to the service path.
    pub fn add_resource(&self, resource: &str, handler: Arc<dyn ActionHandler>) {
        let path = self.full_path(resource);
        debug!(resource = %path, "Added BTP resource");
        self.handlers.write().insert(path, handler);
    }

    pub fn remove_resource(&self, resource: &str) -> Option<Arc<dyn ActionHandler>> {
        let path = self.full_path(resource);
        let removed = self.handlers.write().remove(&path);
        if removed.is_some() {
            debug!(resource = %path, "Removed BTP resource");
        }
        removed
    }

    pub fn resource_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Find the handler for `path`, walking up to the nearest registered
    /// parent. Returns the matched resource path with the handler.
    pub fn find_handler(&self, path: &str) -> Option<(String, Arc<dyn ActionHandler>)> {
        let normalized = normalize_path(path);
        let mut current = normalized
            .split_once('?')
            .map_or(normalized.as_str(), |(p, _)| p);
        let handlers = self.handlers.read();
        loop {
            if let Some(handler) = handlers.get(current) {
                return Some((current.to_string(), handler.clone()));
            }
            current = parent_path(current)?;
        }
    }

    /// Service one request on `conn`, then close it.
    pub async fn service_request(&self, mut conn: HttpConnection, request: HttpHeader) -> Result<()> {
        if self.read_throttler.is_some() {
            conn.set_read_throttler(self.read_throttler.clone());
        }
        if self.write_throttler.is_some() {
            conn.set_write_throttler(self.write_throttler.clone());
        }

        let version_ok = match request.version() {
            HttpVersion::Http11 => true,
            HttpVersion::Http10 => self.allow_http1,
        };
        if !version_ok {
            let mut response = HttpHeader::response(505);
            if let Some(host) = request.get(names::HOST) {
                response.set(names::HOST, host);
            }
            response.set(names::SERVER, SERVER_NAME);
            response.set(names::CONNECTION, "close");
            response.set(names::CONTENT_LENGTH, "0");
            conn.send_header(&response).await?;
            conn.flush().await?;
            let _ = conn.shutdown().await;
            return Ok(());
        }

        let started = Instant::now();
        let secure = conn.is_secure();
        let peer = conn.peer_addr();
        let resource = normalize_path(request.path().unwrap_or("/"));
        let found = self.find_handler(&resource);
        let mut action = Action::new(conn, request, resource);

        let result = match found {
            Some((base, handler)) => {
                action.set_base_path(&base);
                handle_action(handler.as_ref(), &mut action, &self.security).await
            }
            None => {
                let error = BtpError::NoMatchingService {
                    domain: action.request().get(names::HOST).unwrap_or_default().to_string(),
                    path: action.resource_path().to_string(),
                };
                action.send_exception(&error, true).await
            }
        };

        info!(
            secure,
            peer = ?peer,
            method = action.request().method().unwrap_or_default(),
            resource = %action.resource(),
            status = ?action.response().status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Serviced BTP resource"
        );
        if let Err(e) = &result {
            warn!(resource = %action.resource(), error = %e, "Failed to complete BTP action");
        }
        let mut conn = action.into_connection();
        let _ = conn.shutdown().await;
        result
    }
}

impl std::fmt::Debug for BtpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtpService")
            .field("path", &self.path)
            .field("resources", &self.resource_count())
            .finish()
    }
}
