//! Registry module for OCI/Docker registry interactions
//!
//! Leaves first: certificate pool, HTTP transport, credential keychain and
//! retry executor; the distribution protocol built on them; and the
//! [`RegistryClient`] facade composing everything.

pub mod auth;
pub mod certs;
pub mod client;
pub mod distribution;
pub mod protocol;
pub mod remote;
pub mod retry;
pub mod transport;

pub use auth::{Credential, CredentialProvider, DockerConfigKeychain, EnvKeychain, MultiKeychain, default_keychain};
pub use certs::CertPool;
pub use client::{RegistryClient, RegistryClientBuilder};
pub use distribution::HttpDistribution;
pub use protocol::{Descriptor, Image, ImageIndex, Manifest, Platform, RegistryProtocol};
pub use retry::{FixedRetry, Retrier, RetryStrategy};
pub use transport::{TransportSettings, build_transport};
