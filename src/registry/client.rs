//! Registry client facade
//!
//! [`RegistryClient`] parses its arguments, then delegates to the protocol
//! layer. Reads are issued once; writes and tags run under the [`Retrier`] and
//! their failures are labelled with the operation. Each operation looks up
//! credentials at most once per registry host.

use std::sync::Arc;

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::reference::{Digest, ParseOptions, Reference, Repository, Tag};
use crate::registry::auth::{CredentialProvider, MultiKeychain, with_credential_scope};
use crate::registry::certs::CertPool;
use crate::registry::distribution::HttpDistribution;
use crate::registry::protocol::{Descriptor, Image, ImageIndex, Platform, RegistryProtocol};
use crate::registry::remote;
use crate::registry::retry::Retrier;
use crate::registry::transport::build_transport;

const WRITING_IMAGE: &str = "Writing image";
const WRITING_INDEX: &str = "Writing image index";
const WRITING_TAG: &str = "Writing image tag";

/// Assembles a [`RegistryClient`] from a config plus optional overrides
pub struct RegistryClientBuilder {
    config: ClientConfig,
    keychain: Option<Arc<dyn CredentialProvider>>,
    protocol: Option<Arc<dyn RegistryProtocol>>,
    retrier: Retrier,
}

impl RegistryClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            keychain: None,
            protocol: None,
            retrier: Retrier::default(),
        }
    }

    /// Replace the environment-then-default keychain
    pub fn with_keychain(mut self, keychain: Arc<dyn CredentialProvider>) -> Self {
        self.keychain = Some(keychain);
        self
    }

    /// Use `protocol` instead of building an HTTP transport. The configured
    /// CA files are still loaded and must be valid.
    pub fn with_protocol(mut self, protocol: Arc<dyn RegistryProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = retrier;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let options = self.config.parse_options();
        let pool = CertPool::from_files(&self.config.ca_cert_paths)?;
        debug!(
            certificates = pool.len(),
            files = pool.sources().len(),
            "certificate pool loaded"
        );

        let protocol = match self.protocol {
            Some(protocol) => protocol,
            None => {
                let transport = build_transport(&self.config, pool)?;
                let keychain = self
                    .keychain
                    .unwrap_or_else(|| Arc::new(MultiKeychain::standard(&self.config.env_auth_prefix)));
                Arc::new(HttpDistribution::new(transport, keychain))
            }
        };

        Ok(RegistryClient {
            protocol,
            options,
            platform: self.config.platform,
            retrier: self.retrier,
        })
    }
}

/// Typed registry operations over one transport and keychain
#[derive(Clone)]
pub struct RegistryClient {
    protocol: Arc<dyn RegistryProtocol>,
    options: ParseOptions,
    platform: Platform,
    retrier: Retrier,
}

impl RegistryClient {
    /// Load certificates, build the transport and wire the standard keychain
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::builder(config.clone()).build()
    }

    pub fn builder(config: ClientConfig) -> RegistryClientBuilder {
        RegistryClientBuilder::new(config)
    }

    pub fn parse_options(&self) -> ParseOptions {
        self.options
    }

    /// Platform [`get_image`](Self::get_image) picks from an index
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    /// Media type, size and digest of the manifest `reference` names
    pub async fn get_descriptor(&self, reference: &str) -> Result<Descriptor> {
        let reference = Reference::parse(reference, &self.options)?;
        with_credential_scope(self.protocol.head_manifest(&reference)).await
    }

    /// Image at `reference`; an index resolves to the client's platform
    pub async fn get_image(&self, reference: &str) -> Result<Image> {
        let reference = Reference::parse(reference, &self.options)?;
        with_credential_scope(remote::get_image(self.protocol.as_ref(), &reference, &self.platform)).await
    }

    pub async fn get_index(&self, reference: &str) -> Result<ImageIndex> {
        let reference = Reference::parse(reference, &self.options)?;
        with_credential_scope(remote::get_index(self.protocol.as_ref(), &reference)).await
    }

    pub async fn write_image(&self, reference: &str, image: &Image) -> Result<()> {
        let reference = Reference::parse(reference, &self.options)?;
        let protocol = self.protocol.as_ref();
        with_credential_scope(self.retrier.run(|| remote::write_image(protocol, &reference, image)))
            .await
            .map_err(|e| e.labelled(WRITING_IMAGE))
    }

    pub async fn write_index(&self, reference: &str, index: &ImageIndex) -> Result<()> {
        let reference = Reference::parse(reference, &self.options)?;
        let protocol = self.protocol.as_ref();
        with_credential_scope(self.retrier.run(|| remote::write_index(protocol, &reference, index)))
            .await
            .map_err(|e| e.labelled(WRITING_INDEX))
    }

    /// Point tag `dst` at the manifest digest `src`; both steps share one attempt
    pub async fn write_tag(&self, dst: &str, src: &str) -> Result<()> {
        let dst = Tag::parse(dst, &self.options)?;
        let src = Digest::parse(src, &self.options)?;
        let protocol = self.protocol.as_ref();
        with_credential_scope(self.retrier.run(|| remote::tag(protocol, &dst, &src)))
            .await
            .map_err(|e| e.labelled(WRITING_TAG))
    }

    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let repository = Repository::parse(repository, &self.options)?;
        with_credential_scope(self.protocol.list_tags(&repository)).await
    }
}
