//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::reference::ParseOptions;
use crate::registry::protocol::Platform;

/// Settings a [`RegistryClient`](crate::registry::RegistryClient) is built from.
///
/// The value is consumed at construction time; later edits to a config do not
/// reach clients already built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// PEM bundles appended to the system trust store
    pub ca_cert_paths: Vec<PathBuf>,
    /// Verify server certificates. Only an explicit `false` disables
    /// verification, which accepts any certificate the server presents.
    pub verify_certs: bool,
    /// Allow plain-HTTP registries: `http://` references, and an http
    /// fallback when https cannot be reached
    pub insecure: bool,
    /// Prefix for `<PREFIX>_REGISTRY_<HOST>_*` credential variables
    pub env_auth_prefix: String,
    /// Platform an image index resolves to when a single image is requested
    pub platform: Platform,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ca_cert_paths: Vec::new(),
            verify_certs: true,
            insecure: false,
            env_auth_prefix: String::new(),
            platform: Platform::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_paths.push(path.into());
        self
    }

    pub fn with_verify_certs(mut self, verify_certs: bool) -> Self {
        self.verify_certs = verify_certs;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_env_auth_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_auth_prefix = prefix.into();
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Reference-parsing policy derived from this config
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            insecure: self.insecure,
        }
    }
}
