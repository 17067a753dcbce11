//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use btp_crypto::{Profile, ProfileId, UserId};
use btp_protocol::http::BandwidthThrottler;
use btp_protocol::keys::DEFAULT_KEY_CACHE_CAPACITY;
use btp_protocol::ClientConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// User the node acts for; it signs responses as this user's profile.
    pub user_id: UserId,
    pub profile_id: ProfileId,
    /// Hex private key seed of the node profile. A fresh key is generated
    /// when unset.
    pub profile_seed_hex: Option<String>,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    /// Create a self-signed certificate when the cert or key file is missing.
    pub tls_generate: bool,
    /// PEM bundle of certificates trusted for outbound TLS.
    pub trust_roots_path: Option<PathBuf>,
    /// Base URL of the key service used to resolve unknown public keys.
    pub key_service_url: Option<String>,
    pub key_cache_capacity: usize,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub session_cache_size: usize,
    /// Bytes per second; 0 is unlimited.
    pub read_rate_limit: u64,
    pub write_rate_limit: u64,
    /// Also serve HTTP/1.0 requests.
    pub allow_http1: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8200)),
            user_id: 0,
            profile_id: 1,
            profile_seed_hex: None,
            tls_cert_path: PathBuf::from("node-cert.pem"),
            tls_key_path: PathBuf::from("node-key.pem"),
            tls_generate: true,
            trust_roots_path: None,
            key_service_url: None,
            key_cache_capacity: DEFAULT_KEY_CACHE_CAPACITY,
            connect_timeout_secs: 10,
            io_timeout_secs: 30,
            session_cache_size: 50,
            read_rate_limit: 0,
            write_rate_limit: 0,
            allow_http1: false,
        }
    }
}

fn invalid(field: &str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(format!("Invalid {field}: {e}"))
}

impl NodeConfig {
    /// Load configuration from environment variables and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Environment overrides
        config.apply_env(|name| std::env::var(name).ok())?;

        // TOML config file (if specified)
        if let Ok(config_path) = std::env::var("BTP_NODE_CONFIG") {
            config.load_from_toml(&config_path)?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Apply `BTP_NODE_*` overrides, reading variables through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(addr) = lookup("BTP_NODE_LISTEN_ADDR") {
            self.listen_addr = addr.parse().map_err(|e| invalid("listen_addr", e))?;
        }
        if let Some(id) = lookup("BTP_NODE_USER_ID") {
            self.user_id = id.parse().map_err(|e| invalid("user_id", e))?;
        }
        if let Some(id) = lookup("BTP_NODE_PROFILE_ID") {
            self.profile_id = id.parse().map_err(|e| invalid("profile_id", e))?;
        }
        if let Some(seed) = lookup("BTP_NODE_PROFILE_SEED") {
            self.profile_seed_hex = Some(seed);
        }
        if let Some(path) = lookup("BTP_NODE_CERT_PATH") {
            self.tls_cert_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("BTP_NODE_KEY_PATH") {
            self.tls_key_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("BTP_NODE_TLS_GENERATE") {
            self.tls_generate = flag.parse().map_err(|e| invalid("tls_generate", e))?;
        }
        if let Some(path) = lookup("BTP_NODE_TRUST_ROOTS") {
            self.trust_roots_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("BTP_NODE_KEY_SERVICE_URL") {
            self.key_service_url = Some(url);
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id == 0 {
            return Err(ConfigError::Invalid("user_id must be > 0".to_string()));
        }

        if self.profile_id == 0 {
            return Err(ConfigError::Invalid("profile_id must be > 0".to_string()));
        }

        if self.key_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "key_cache_capacity must be > 0".to_string(),
            ));
        }

        if self.connect_timeout_secs == 0 || self.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }

        if !self.tls_generate {
            if !self.tls_cert_path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }
            if !self.tls_key_path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        if let Some(url) = &self.key_service_url {
            self.parse_key_service_url(url)?;
        }

        Ok(())
    }

    fn parse_key_service_url(&self, url: &str) -> Result<Url, ConfigError> {
        let url = Url::parse(url).map_err(|e| invalid("key_service_url", e))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(invalid("key_service_url", format!("unsupported scheme '{other}'"))),
        }
    }

    /// Load from TOML config file
    pub fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let toml_config: toml::Value = toml::from_str(&content)?;
        self.apply_toml(&toml_config)
    }

    fn apply_toml(&mut self, toml_config: &toml::Value) -> Result<(), ConfigError> {
        let string = |key: &str| toml_config.get(key).and_then(|v| v.as_str());
        let integer = |key: &str| -> Result<Option<u64>, ConfigError> {
            match toml_config.get(key).and_then(|v| v.as_integer()) {
                Some(n) => u64::try_from(n)
                    .map(Some)
                    .map_err(|_| invalid(key, "must not be negative")),
                None => Ok(None),
            }
        };
        let boolean = |key: &str| toml_config.get(key).and_then(|v| v.as_bool());

        if let Some(addr) = string("listen_addr") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| invalid("listen_addr in TOML", e))?;
        }
        if let Some(id) = integer("user_id")? {
            self.user_id = id;
        }
        if let Some(id) = integer("profile_id")? {
            self.profile_id = id;
        }
        if let Some(seed) = string("profile_seed_hex") {
            self.profile_seed_hex = Some(seed.to_string());
        }
        if let Some(path) = string("tls_cert_path") {
            self.tls_cert_path = PathBuf::from(path);
        }
        if let Some(path) = string("tls_key_path") {
            self.tls_key_path = PathBuf::from(path);
        }
        if let Some(flag) = boolean("tls_generate") {
            self.tls_generate = flag;
        }
        if let Some(path) = string("trust_roots_path") {
            self.trust_roots_path = Some(PathBuf::from(path));
        }
        if let Some(url) = string("key_service_url") {
            self.key_service_url = Some(url.to_string());
        }
        if let Some(n) = integer("key_cache_capacity")? {
            self.key_cache_capacity = n as usize;
        }
        if let Some(n) = integer("connect_timeout_secs")? {
            self.connect_timeout_secs = n;
        }
        if let Some(n) = integer("io_timeout_secs")? {
            self.io_timeout_secs = n;
        }
        if let Some(n) = integer("session_cache_size")? {
            self.session_cache_size = n as usize;
        }
        if let Some(n) = integer("read_rate_limit")? {
            self.read_rate_limit = n;
        }
        if let Some(n) = integer("write_rate_limit")? {
            self.write_rate_limit = n;
        }
        if let Some(flag) = boolean("allow_http1") {
            self.allow_http1 = flag;
        }

        Ok(())
    }

    /// The node's signing profile.
    pub fn load_profile(&self) -> Result<Profile, ConfigError> {
        match &self.profile_seed_hex {
            Some(seed) => Profile::from_seed_hex(self.user_id, self.profile_id, seed)
                .map_err(|e| invalid("profile_seed_hex", e)),
            None => {
                warn!(
                    user_id = self.user_id,
                    "No profile seed configured, generating an ephemeral profile key"
                );
                Ok(Profile::generate(self.user_id, self.profile_id))
            }
        }
    }

    pub fn key_service_url(&self) -> Result<Option<Url>, ConfigError> {
        self.key_service_url
            .as_deref()
            .map(|url| self.parse_key_service_url(url))
            .transpose()
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    fn throttler(rate: u64) -> Option<Arc<BandwidthThrottler>> {
        (rate > 0).then(|| Arc::new(BandwidthThrottler::new(rate)))
    }

    pub fn read_throttler(&self) -> Option<Arc<BandwidthThrottler>> {
        Self::throttler(self.read_rate_limit)
    }

    pub fn write_throttler(&self) -> Option<Arc<BandwidthThrottler>> {
        Self::throttler(self.write_rate_limit)
    }

    /// Convert to the outbound client configuration
    pub fn to_client_config(&self) -> Result<ClientConfig, ConfigError> {
        let mut client = ClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: self.io_timeout(),
            write_timeout: self.io_timeout(),
            session_cache_size: self.session_cache_size,
            read_throttler: self.read_throttler(),
            write_throttler: self.write_throttler(),
            ..ClientConfig::default()
        };
        if let Some(path) = &self.trust_roots_path {
            let pem = std::fs::read(path)?;
            let added = client
                .add_pem_roots(&pem)
                .map_err(|e| invalid("trust_roots_path", e))?;
            if added == 0 {
                return Err(invalid(
                    "trust_roots_path",
                    format!("no certificates in {path:?}"),
                ));
            }
        }
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_default_requires_user() {
        let config = NodeConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NodeConfig::default();
        config
            .apply_env(env(&[
                ("BTP_NODE_LISTEN_ADDR", "127.0.0.1:9000"),
                ("BTP_NODE_USER_ID", "100"),
                ("BTP_NODE_TLS_GENERATE", "true"),
                ("BTP_NODE_KEY_SERVICE_URL", "https://keys.example.com/"),
            ]))
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.user_id, 100);
        config.validate().unwrap();
        assert_eq!(
            config.key_service_url().unwrap().unwrap().host_str(),
            Some("keys.example.com")
        );
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_env(env(&[("BTP_NODE_USER_ID", "alice")]))
            .unwrap_err();
        assert!(err.to_string().contains("user_id"));
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen_addr = "127.0.0.1:9100"
user_id = 7
profile_id = 2
tls_generate = false
key_cache_capacity = 12
read_rate_limit = 4096
"#
        )
        .unwrap();

        let mut config = NodeConfig::default();
        config
            .load_from_toml(file.path().to_str().unwrap())
            .unwrap();
        assert_eq!(config.user_id, 7);
        assert_eq!(config.profile_id, 2);
        assert_eq!(config.key_cache_capacity, 12);
        assert!(config.read_throttler().is_some());
        assert!(config.write_throttler().is_none());

        // Certificates must exist when generation is off
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_toml_integer() {
        let mut config = NodeConfig::default();
        let value: toml::Value = toml::from_str("user_id = -3").unwrap();
        assert!(config.apply_toml(&value).is_err());
    }

    #[test]
    fn test_key_service_scheme() {
        let config = NodeConfig {
            user_id: 1,
            key_service_url: Some("ftp://keys".to_string()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_profile_from_seed() {
        let config = NodeConfig {
            user_id: 5,
            profile_seed_hex: Some("11".repeat(32)),
            ..NodeConfig::default()
        };
        let a = config.load_profile().unwrap();
        let b = config.load_profile().unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.user_id(), 5);

        let bad = NodeConfig {
            profile_seed_hex: Some("abc".to_string()),
            ..config
        };
        assert!(bad.load_profile().is_err());
    }
}
