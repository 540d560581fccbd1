//! Client configuration
//!
//! Loading configuration is left to the caller: [`ClientConfig`] is `Deserialize`, so it
//! can come from any serde format, and it has builder style setters for code. Durations
//! are given in milliseconds when deserialized, and a missing duration disables the
//! corresponding timeout.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::filter::HostnameVerifier;

pub const DEFAULT_MAX_CONNECTIONS_PER_DESTINATION: usize = 20;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_CHUNK_SIZE_DIGITS: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("failed to read trust material from {path}: {source}")]
    TrustMaterial { path: PathBuf, source: io::Error },

    #[error("tls configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to build the runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl ConfigError {
    pub fn invalid<S: ToString>(str: S) -> Self {
        Self::Invalid { reason: str.to_string() }
    }
}

/// Settings shared by every connection of a client.
///
/// Deserializes with every field optional; timeouts are given in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// connections a destination pool opens at most, connecting ones included
    pub max_connections_per_destination: usize,
    /// also bounds the trailer block of a chunked body
    pub max_header_size: usize,
    pub max_chunk_size_digits: usize,
    #[serde(deserialize_with = "millis")]
    pub connect_timeout: Option<Duration>,
    /// from the end of the request write to the response header
    #[serde(deserialize_with = "millis")]
    pub response_timeout: Option<Duration>,
    /// how long a keep-alive connection waits for its next request
    #[serde(deserialize_with = "millis")]
    pub idle_timeout: Option<Duration>,
    pub proxy: Option<ProxyConfig>,
    pub tls: TlsConfig,
    pub thread_pool: ThreadPoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections_per_destination: DEFAULT_MAX_CONNECTIONS_PER_DESTINATION,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_chunk_size_digits: DEFAULT_MAX_CHUNK_SIZE_DIGITS,
            connect_timeout: None,
            response_timeout: None,
            idle_timeout: None,
            proxy: None,
            tls: TlsConfig::default(),
            thread_pool: ThreadPoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Caps the connections opened to one destination. Requests beyond it are queued.
    pub fn with_max_connections_per_destination(mut self, max: usize) -> Self {
        self.max_connections_per_destination = max;
        self
    }

    /// Largest response header block, in bytes.
    pub fn with_max_header_size(mut self, max: usize) -> Self {
        self.max_header_size = max;
        self
    }

    /// Most hex digits accepted in a chunk size line.
    pub fn with_max_chunk_size_digits(mut self, max: usize) -> Self {
        self.max_chunk_size_digits = max;
        self
    }

    /// Bounds opening the transport, proxy tunnel and TLS handshake included.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Bounds the wait for a response header once the request is sent.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Closes connections idle for longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Tunnels every connection through `proxy`.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_thread_pool(mut self, thread_pool: ThreadPoolConfig) -> Self {
        self.thread_pool = thread_pool;
        self
    }

    /// Rejects settings no connection could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_destination == 0 {
            return Err(ConfigError::invalid("max_connections_per_destination must be positive"));
        }
        if self.max_header_size == 0 {
            return Err(ConfigError::invalid("max_header_size must be positive"));
        }
        // a chunk size is a u64
        if !(1..=16).contains(&self.max_chunk_size_digits) {
            return Err(ConfigError::invalid(format!("max_chunk_size_digits must be within 1..=16, got {}", self.max_chunk_size_digits)));
        }
        for (name, timeout) in [("connect_timeout", self.connect_timeout), ("response_timeout", self.response_timeout), ("idle_timeout", self.idle_timeout)] {
            if timeout.is_some_and(|timeout| timeout.is_zero()) {
                return Err(ConfigError::invalid(format!("{name} must not be zero, leave it unset to disable it")));
            }
        }
        if let Some(proxy) = &self.proxy
            && proxy.host.trim().is_empty()
        {
            return Err(ConfigError::invalid("proxy host must not be empty"));
        }
        if self.thread_pool.worker_threads == Some(0) {
            return Err(ConfigError::invalid("worker_threads must be positive"));
        }
        Ok(())
    }
}

/// An HTTP proxy reached with `CONNECT`, optionally with Basic or Digest credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self { host: host.into(), port, username: None, password: None }
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Trust configuration for `https` destinations.
///
/// Host names are always checked against the certificate. A [`HostnameVerifier`] adds a
/// check of its own on top, and a prebuilt `rustls::ClientConfig` replaces everything
/// else here.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file of additional trusted certificates
    pub ca_file: Option<PathBuf>,
    pub use_webpki_roots: bool,
    #[serde(skip)]
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    #[serde(skip)]
    pub hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self { ca_file: None, use_webpki_roots: true, client_config: None, hostname_verifier: None }
    }
}

impl TlsConfig {
    pub fn with_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_client_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.client_config = Some(config);
        self
    }

    pub fn with_hostname_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.hostname_verifier = Some(verifier);
        self
    }

    pub fn build(&self) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
        if let Some(config) = &self.client_config {
            return Ok(Arc::clone(config));
        }

        let mut roots = RootCertStore::empty();
        if self.use_webpki_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        if let Some(path) = &self.ca_file {
            let trust_error = |source| ConfigError::TrustMaterial { path: path.clone(), source };
            let mut reader = BufReader::new(File::open(path).map_err(trust_error)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots.add(cert.map_err(trust_error)?)?;
            }
        }
        if roots.is_empty() {
            return Err(ConfigError::invalid("no trusted certificate configured"));
        }
        debug!(roots = roots.len(), "building tls client configuration");

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_file", &self.ca_file)
            .field("use_webpki_roots", &self.use_webpki_roots)
            .field("client_config", &self.client_config.is_some())
            .field("hostname_verifier", &self.hostname_verifier.is_some())
            .finish()
    }
}

/// The runtime a client builds for itself when it is not handed one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// `None` uses one worker per core
    pub worker_threads: Option<usize>,
    pub max_blocking_threads: usize,
    /// run body stream listeners on the blocking pool instead of the connection task
    pub listener_executor: bool,
    pub thread_name: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self { worker_threads: None, max_blocking_threads: 512, listener_executor: false, thread_name: "micro-client".to_owned() }
    }
}

impl ThreadPoolConfig {
    /// Builds a multi-thread runtime with every driver enabled.
    pub fn build_runtime(&self) -> Result<Runtime, ConfigError> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(self.thread_name.clone()).max_blocking_threads(self.max_blocking_threads.max(1));
        if let Some(worker_threads) = self.worker_threads {
            builder.worker_threads(worker_threads);
        }
        builder.build().map_err(ConfigError::Runtime)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_connections_per_destination, 20);
        assert_eq!(config.max_header_size, 8 * 1024);
        assert_eq!(config.max_chunk_size_digits, 16);
        assert!(config.connect_timeout.is_none());
        assert!(config.tls.use_webpki_roots);
        config.validate().unwrap();
    }

    #[test]
    fn deserialize_with_millis() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "max_connections_per_destination": 4,
                "connect_timeout": 1500,
                "idle_timeout": null,
                "proxy": { "host": "proxy.local", "port": 3128, "username": "user", "password": "secret" },
                "thread_pool": { "worker_threads": 2, "listener_executor": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_connections_per_destination, 4);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.response_timeout, None);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.proxy, Some(ProxyConfig::new("proxy.local", 3128).with_credentials("user", "secret")));
        assert_eq!(config.thread_pool.worker_threads, Some(2));
        assert!(config.thread_pool.listener_executor);
        assert_eq!(config.thread_pool.thread_name, "micro-client");
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects() {
        assert!(ClientConfig::default().with_max_connections_per_destination(0).validate().is_err());
        assert!(ClientConfig::default().with_max_chunk_size_digits(17).validate().is_err());
        assert!(ClientConfig::default().with_connect_timeout(Duration::ZERO).validate().is_err());
        assert!(ClientConfig::default().with_proxy(ProxyConfig::new(" ", 80)).validate().is_err());
    }

    #[test]
    fn tls_config_builds_with_webpki_roots() {
        TlsConfig::default().build().unwrap();
    }

    #[test]
    fn tls_config_without_roots() {
        let tls = TlsConfig { use_webpki_roots: false, ..TlsConfig::default() };
        assert!(matches!(tls.build(), Err(ConfigError::Invalid { .. })));

        let tls = TlsConfig { use_webpki_roots: false, ..TlsConfig::default() }.with_ca_file("/nonexistent/ca.pem");
        assert!(matches!(tls.build(), Err(ConfigError::TrustMaterial { .. })));
    }
}
