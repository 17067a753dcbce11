//! TLS identities and virtual hosts.
//!
//! The server presents one base certificate. Each user the node hosts can
//! add a virtual host named by its identity name; SNI picks the matching
//! certificate and anything unknown falls back to the base.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, pkcs8_private_keys};
use tracing::{debug, info};

use crate::errors::{Result, ServerError};

/// Load certificate chain from file
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = std::fs::read(path)?;
    let chain = certs(&mut cert_file.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Certificate(format!("bad certificate in {path:?}: {e}")))?;
    if chain.is_empty() {
        return Err(ServerError::Certificate(format!(
            "no certificates found in {path:?}"
        )));
    }
    Ok(chain)
}

/// Load private key from file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let key_file = std::fs::read(path)?;
    let mut keys = pkcs8_private_keys(&mut key_file.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Certificate(format!("bad private key in {path:?}: {e}")))?;

    if keys.is_empty() {
        return Err(ServerError::Certificate(format!(
            "no private keys found in {path:?}"
        )));
    }

    Ok(PrivateKeyDer::from(keys.remove(0)))
}

/// A certificate chain and its private key.
#[derive(Debug)]
pub struct TlsIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    cert_pem: String,
    key_pem: String,
}

impl TlsIdentity {
    /// Self-signed certificate for `name`.
    pub fn self_signed(name: &str) -> Result<Self> {
        let params = leaf_params(name)?;
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self::from_parts(cert.der().clone(), cert.pem(), &key))
    }

    fn from_parts(cert: CertificateDer<'static>, cert_pem: String, key: &KeyPair) -> Self {
        Self {
            chain: vec![cert],
            key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
            cert_pem,
            key_pem: key.serialize_pem(),
        }
    }

    /// Load a PEM certificate chain and PKCS#8 key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        Ok(Self {
            chain: load_cert_chain(cert_path)?,
            key: load_private_key(key_path)?,
            cert_pem: std::fs::read_to_string(cert_path)?,
            key_pem: std::fs::read_to_string(key_path)?,
        })
    }

    /// Load from `cert_path`/`key_path`, first creating a self-signed
    /// certificate for `name` when `generate` is set and either file is
    /// missing.
    pub fn load_or_generate(
        name: &str,
        cert_path: &Path,
        key_path: &Path,
        generate: bool,
    ) -> Result<Self> {
        if generate && (!cert_path.exists() || !key_path.exists()) {
            info!(name, "Creating self-signed TLS certificate");
            Self::self_signed(name)?.save(cert_path, key_path)?;
        }
        Self::load(cert_path, key_path)
    }

    /// Write the certificate and key as PEM.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)?;
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Build the signing form rustls serves.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.key)?;
        Ok(Arc::new(CertifiedKey::new(self.chain.clone(), signing_key)))
    }
}

fn leaf_params(name: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![name.to_string()])?;
    params.distinguished_name.push(DnType::CommonName, name);
    Ok(params)
}

/// A certificate authority that issues identity certificates.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    pub fn new(name: &str) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a certificate for `name`. The chain ends with this authority.
    pub fn issue(&self, name: &str) -> Result<TlsIdentity> {
        let params = leaf_params(name)?;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        let mut identity = TlsIdentity::from_parts(cert.der().clone(), cert.pem(), &key);
        identity.chain.push(self.cert_der());
        identity.cert_pem.push_str(&self.cert_pem());
        Ok(identity)
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

/// Picks the server certificate by SNI name.
#[derive(Debug)]
pub struct VirtualHostResolver {
    base_name: String,
    base: Arc<CertifiedKey>,
    hosts: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl VirtualHostResolver {
    /// `base` is served under `base_name` and for every unknown name.
    pub fn new(base_name: impl Into<String>, base: Arc<CertifiedKey>) -> Self {
        Self {
            base_name: base_name.into(),
            base,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Publish a virtual host, replacing any previous entry for `name`.
    pub fn add(&self, name: &str, key: Arc<CertifiedKey>) {
        debug!(name, "Adding virtual host");
        self.hosts.write().insert(name.to_ascii_lowercase(), key);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        debug!(name, "Removing virtual host");
        self.hosts.write().remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.read().contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// The certificate served for `name`.
    pub fn select(&self, name: Option<&str>) -> Arc<CertifiedKey> {
        name.and_then(|n| self.hosts.read().get(&n.to_ascii_lowercase()).cloned())
            .unwrap_or_else(|| self.base.clone())
    }
}

impl ResolvesServerCert for VirtualHostResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.select(client_hello.server_name()))
    }
}

/// Server TLS settings over `resolver`.
pub fn server_tls_config(resolver: Arc<VirtualHostResolver>) -> Result<Arc<rustls::ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    Ok(Arc::new(config))
}
