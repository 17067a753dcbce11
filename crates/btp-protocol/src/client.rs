//! Outbound BTP exchanges.
//!
//! A [`Client`] opens one connection per exchange, sends a signed request
//! and receives the response into a caller-supplied message. The response
//! must pass header verification and must echo the request's `Host`, or it
//! is treated as a breach.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

use btp_crypto::{user_common_name, UserId};

use crate::errors::{BreachKind, BtpError, ClientErrorKind, Result};
use crate::http::connection::DEFAULT_IO_TIMEOUT;
use crate::http::{names, BandwidthThrottler, BodyFraming, HttpConnection, HttpHeader};
use crate::message::BtpMessage;

/// `User-Agent` sent with every request.
pub const CLIENT_USER_AGENT: &str = "BtpClient/1.0";

/// Number of TLS sessions kept for resumption.
pub const DEFAULT_SESSION_CACHE_SIZE: usize = 50;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Bound on cached TLS sessions across all peers.
    pub session_cache_size: usize,
    /// Trust anchors for TLS peers.
    pub roots: RootCertStore,
    pub read_throttler: Option<Arc<BandwidthThrottler>>,
    pub write_throttler: Option<Arc<BandwidthThrottler>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            session_cache_size: DEFAULT_SESSION_CACHE_SIZE,
            roots: RootCertStore::empty(),
            read_throttler: None,
            write_throttler: None,
        }
    }
}

impl ClientConfig {
    /// Trust every certificate in a PEM bundle. Returns how many were added.
    pub fn add_pem_roots(&mut self, pem: &[u8]) -> Result<usize> {
        let mut reader = std::io::BufReader::new(pem);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            self.add_der_root(cert?)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn add_der_root(&mut self, der: CertificateDer<'static>) -> Result<()> {
        self.roots
            .add(der)
            .map_err(|e| BtpError::Tls(format!("bad trust anchor: {e}")))
    }
}

fn build_tls_config(config: &ClientConfig) -> Result<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BtpError::Tls(e.to_string()))?
        .with_root_certificates(config.roots.clone())
        .with_no_client_auth();
    tls.resumption = rustls::client::Resumption::in_memory_sessions(config.session_cache_size);
    Ok(Arc::new(tls))
}

/// `host[:port]` of a URL, as sent in `Host`.
pub fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Path and query of a URL, as sent in the request line.
fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Sends BTP requests and receives their responses.
pub struct Client {
    config: ClientConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let tls = build_tls_config(&config)?;
        Ok(Self { config, tls })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tls_config(&self) -> &Arc<rustls::ClientConfig> {
        &self.tls
    }

    /// Open a connection to `url`.
    ///
    /// `https` URLs use TLS. When `peer_id` names a user, the server must
    /// present a certificate for that user's identity name rather than for
    /// the URL host.
    pub async fn connect(
        &self,
        peer_id: UserId,
        url: &Url,
        timeout: Option<Duration>,
    ) -> Result<HttpConnection> {
        let connect_error = |reason: String| BtpError::Connect {
            url: url.to_string(),
            reason,
        };
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(connect_error(format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| connect_error("missing host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| connect_error("missing port".to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let connect_timeout = timeout.unwrap_or(self.config.connect_timeout);
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| BtpError::Timeout)?
            .map_err(|e| connect_error(e.to_string()))?;
        let _ = tcp.set_nodelay(true);
        let peer_addr = tcp.peer_addr().ok();

        let mut conn = if secure {
            let name = if peer_id != 0 {
                user_common_name(peer_id)
            } else {
                host.to_string()
            };
            let server_name = ServerName::try_from(name.as_str())
                .map_err(|e| connect_error(format!("invalid server name '{name}': {e}")))?
                .to_owned();
            let connector = TlsConnector::from(self.tls.clone());
            let stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| BtpError::Timeout)?
                .map_err(|e| connect_error(format!("tls handshake failed: {e}")))?;
            HttpConnection::new(stream, true)
        } else {
            HttpConnection::new(tcp, false)
        };
        if let Some(addr) = peer_addr {
            conn = conn.with_peer_addr(addr);
        }

        let (read, write) = match timeout {
            Some(t) => (t, t),
            None => (self.config.read_timeout, self.config.write_timeout),
        };
        conn.set_timeouts(read, write);
        conn.set_read_throttler(self.config.read_throttler.clone());
        conn.set_write_throttler(self.config.write_throttler.clone());
        debug!(url = %url, peer_id, secure, "BTP connection established");
        Ok(conn)
    }

    /// The request head for `out` addressed to `url`.
    fn request_header(out: &BtpMessage, url: &Url) -> HttpHeader {
        let mut header = HttpHeader::request(out.kind().as_str(), &request_target(url));
        header.set(names::HOST, url_authority(url));
        header.set(names::USER_AGENT, CLIENT_USER_AGENT);
        header.set(names::ACCEPT, crate::codec::ContentType::JSON_MIME);
        header.set(names::ACCEPT_ENCODING, "deflate, gzip");
        header.set(names::CONNECTION, "close, TE");
        header.set(names::TE, "trailers, chunked");
        header
    }

    /// Send `out` to `url` and receive the response into `inbound`.
    ///
    /// On success the response head is returned and the body has been
    /// received into `inbound`. A response that fails verification or does
    /// not echo the request `Host` is a [`BtpError::SecurityBreach`]. A
    /// status of 400 or above is returned as a typed error carrying the
    /// remote error payload, if the server sent one. Nothing is retried.
    pub async fn exchange(
        &self,
        peer_id: UserId,
        url: &Url,
        out: &mut BtpMessage,
        inbound: &mut BtpMessage,
        timeout: Option<Duration>,
    ) -> Result<HttpHeader> {
        let mut conn = self.connect(peer_id, url, timeout).await?;
        let result = self.exchange_on(&mut conn, url, out, inbound).await;
        let _ = conn.shutdown().await;
        result
    }

    async fn exchange_on(
        &self,
        conn: &mut HttpConnection,
        url: &Url,
        out: &mut BtpMessage,
        inbound: &mut BtpMessage,
    ) -> Result<HttpHeader> {
        let request = Self::request_header(out, url);
        let method = out.kind().as_str();
        let request_host = url_authority(url);
        out.send(conn, request, None).await?;

        let response = conn.receive_header().await?.ok_or_else(|| {
            BtpError::Malformed("connection closed before a response was received".to_string())
        })?;
        let status = response
            .status()
            .ok_or_else(|| BtpError::Malformed("expected a response status line".to_string()))?;

        inbound.check_header_security(&response).await;
        inbound.ensure_not_breached()?;
        let response_host = response.get(names::HOST).unwrap_or_default();
        if response_host != request_host {
            let kind = BreachKind::HostMismatch {
                request_host,
                response_host: response_host.to_string(),
            };
            inbound.mark_breach(kind.clone());
            return Err(BtpError::SecurityBreach(kind));
        }

        let framing = BodyFraming::for_response(&response, method);
        if status >= 400 {
            let remote = inbound.receive_error(conn, &response, framing).await?;
            inbound.ensure_not_breached()?;
            let resource = url.to_string();
            info!(status, resource = %resource, "BTP request failed");
            return Err(if status >= 500 {
                BtpError::Server {
                    status,
                    resource,
                    remote,
                }
            } else {
                BtpError::Client {
                    kind: ClientErrorKind::from_status(status),
                    status,
                    resource,
                    remote,
                }
            });
        }

        inbound.receive_content(conn, &response, framing).await?;
        inbound.ensure_not_breached()?;
        Ok(response)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorPayload;
    use crate::keys::{ResolvedKey, StaticKeyResolver};
    use crate::message::MessageKind;
    use btp_crypto::Profile;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Serve one request, answering with `respond`.
    async fn serve_once<F>(respond: F) -> Url
    where
        F: FnOnce(HttpHeader) -> (HttpHeader, BtpMessage) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut conn = HttpConnection::new(tcp, false);
            let request = conn.receive_header().await.unwrap().unwrap();
            let mut body = crate::http::BodyReader::new(BodyFraming::for_request(&request));
            conn.skip_body(&mut body).await.unwrap();
            let (header, mut message) = respond(request);
            message.send(&mut conn, header, None).await.unwrap();
            let _ = conn.shutdown().await;
        });
        Url::parse(&format!("http://{addr}/resource")).unwrap()
    }

    fn response_to(request: &HttpHeader, status: u16) -> HttpHeader {
        let mut header = HttpHeader::response(status);
        header.set(names::HOST, request.get(names::HOST).unwrap_or_default());
        header
    }

    fn client() -> Client {
        Client::new(ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_success_decodes_body() {
        let url = serve_once(|request| {
            assert_eq!(request.get(names::USER_AGENT), Some(CLIENT_USER_AGENT));
            assert_eq!(request.get(names::TE), Some("trailers, chunked"));
            let mut message = BtpMessage::new();
            message.set_content_value(json!({"ok": true}));
            (response_to(&request, 200), message)
        })
        .await;

        let mut out = BtpMessage::with_kind(MessageKind::Get);
        let mut inbound = BtpMessage::new();
        let response = client()
            .exchange(0, &url, &mut out, &mut inbound, None)
            .await
            .unwrap();
        assert_eq!(response.status(), Some(200));
        assert_eq!(inbound.content_value(), Some(&json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_not_found_carries_remote_error() {
        let url = serve_once(|request| {
            let mut message = BtpMessage::new();
            message
                .set_content_object(&ErrorPayload::new("bitmunk.test.Missing", "no such ware").with_code(404))
                .unwrap();
            (response_to(&request, 404), message)
        })
        .await;

        let err = client()
            .exchange(0, &url, &mut BtpMessage::new(), &mut BtpMessage::new(), None)
            .await
            .unwrap_err();
        match err {
            BtpError::Client {
                kind,
                status,
                remote,
                ..
            } => {
                assert_eq!(kind, ClientErrorKind::NotFound);
                assert_eq!(status, 404);
                assert_eq!(remote.unwrap().kind, "bitmunk.test.Missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let url = serve_once(|request| (response_to(&request, 503), BtpMessage::new())).await;
        let err = client()
            .exchange(0, &url, &mut BtpMessage::new(), &mut BtpMessage::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BtpError::Server { status: 503, remote: None, .. }));
    }

    #[tokio::test]
    async fn test_host_mismatch_is_breach() {
        let profile = Arc::new(Profile::generate(7, 1));
        let signer = profile.clone();
        let url = serve_once(move |_request| {
            let mut header = HttpHeader::response(200);
            header.set(names::HOST, "elsewhere.example:19100");
            let mut message = BtpMessage::new();
            message.set_signer(Some(signer));
            (header, message)
        })
        .await;

        let resolver = Arc::new(StaticKeyResolver::new());
        resolver.pin(7, 1, ResolvedKey::new(profile.public_key(), false));
        let mut inbound = BtpMessage::new();
        inbound.set_key_resolver(Some(resolver));
        let err = client()
            .exchange(0, &url, &mut BtpMessage::new(), &mut inbound, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BtpError::SecurityBreach(BreachKind::HostMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = client()
            .exchange(0, &url, &mut BtpMessage::new(), &mut BtpMessage::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BtpError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let url = Url::parse("ftp://127.0.0.1/x").unwrap();
        let err = client().connect(0, &url, None).await.unwrap_err();
        assert!(matches!(err, BtpError::Connect { .. }));
    }

    #[test]
    fn test_authority_and_target() {
        let url = Url::parse("https://node.example:19200/api/3.0/wares?id=4").unwrap();
        assert_eq!(url_authority(&url), "node.example:19200");
        assert_eq!(request_target(&url), "/api/3.0/wares?id=4");
        let url = Url::parse("http://node.example/").unwrap();
        assert_eq!(url_authority(&url), "node.example");
    }
}
