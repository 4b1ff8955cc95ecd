//! HTTP transport for registry traffic
//!
//! The timeouts and pool limits are fixed. Proxies come from the standard
//! `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY` environment variables.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::config::ClientConfig;
use crate::error::{RegistryError, Result};
use crate::registry::certs::CertPool;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Fixed transport parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    /// Applied per host
    pub max_idle_connections: usize,
    pub idle_connection_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// Enforced as a per-read idle timeout, so it bounds body reads as well
    pub response_header_timeout: Duration,
    pub expect_continue_timeout: Duration,
}

impl TransportSettings {
    pub const REGISTRY: TransportSettings = TransportSettings {
        dial_timeout: Duration::from_secs(30),
        keep_alive: Duration::from_secs(30),
        max_idle_connections: 100,
        idle_connection_timeout: Duration::from_secs(90),
        tls_handshake_timeout: Duration::from_secs(10),
        response_header_timeout: Duration::from_secs(10),
        expect_continue_timeout: Duration::from_secs(1),
    };

    /// Budget for establishing a connection, TCP dial plus TLS handshake
    pub fn connect_timeout(&self) -> Duration {
        self.dial_timeout + self.tls_handshake_timeout
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::REGISTRY
    }
}

/// Build the shared HTTP client from `config` and an already loaded `pool`.
///
/// Happy-eyeballs dual-stack dialing is the connector's default. Requests are
/// never sent with `Expect: 100-continue`, so the expect timeout has nothing
/// to bound. The response-header timeout is enforced as a per-read timeout.
pub fn build_transport(config: &ClientConfig, pool: CertPool) -> Result<Client> {
    let settings = TransportSettings::REGISTRY;

    if !config.verify_certs {
        warn!("TLS certificate verification is disabled; any server certificate will be accepted");
    }

    let builder = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(settings.connect_timeout())
        .tcp_keepalive(settings.keep_alive)
        .pool_max_idle_per_host(settings.max_idle_connections)
        .pool_idle_timeout(settings.idle_connection_timeout)
        .read_timeout(settings.response_header_timeout)
        .danger_accept_invalid_certs(!config.verify_certs);

    pool.apply(builder).build().map_err(RegistryError::TransportBuild)
}

/// Load the configured CA files and build the transport in one step
pub fn transport_from_config(config: &ClientConfig) -> Result<Client> {
    let pool = CertPool::from_files(&config.ca_cert_paths)?;
    build_transport(config, pool)
}
