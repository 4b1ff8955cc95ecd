//! Image Registry Client Library
//!
//! A hardened client for OCI/Docker registries: custom CA trust, fixed
//! transport timeouts, layered keychain authentication and retried writes.
//!
//! ```no_run
//! use image_registry_client::{ClientConfig, RegistryClient};
//!
//! # async fn run() -> image_registry_client::Result<()> {
//! let config = ClientConfig::new().with_env_auth_prefix("DEPLOY");
//! let client = RegistryClient::new(&config)?;
//!
//! let digest = client.get_descriptor("ghcr.io/org/app:v1").await?.digest;
//! client
//!     .write_tag("ghcr.io/org/app:stable", &format!("ghcr.io/org/app@{}", digest))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod reference;
pub mod registry;

pub use config::ClientConfig;
pub use error::{RegistryError, Result};
pub use reference::{Digest, ParseOptions, Reference, Registry, Repository, Tag};
pub use registry::{RegistryClient, RegistryClientBuilder};
