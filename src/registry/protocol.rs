//! Registry content model and the protocol seam
//!
//! [`RegistryProtocol`] is the set of distribution-API primitives the client is
//! built on. [`HttpDistribution`](crate::registry::HttpDistribution) is the
//! network implementation; tests substitute in-memory ones.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest as _, Sha256};

use crate::error::{RegistryError, Result};
use crate::reference::{Reference, Repository};

pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Manifest types requested when fetching by tag or digest
    pub const ACCEPTED_MANIFESTS: [&str; 4] = [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST];

    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
    }
}

/// Operating system and CPU architecture an image is built for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Parse `os/arch[/variant]`, e.g. `linux/arm64/v8`
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self::new(*os, *arch).with_variant(*variant))
            }
            _ => Err(RegistryError::protocol(
                "Parsing platform",
                input,
                "expected os/arch[/variant]",
            )),
        }
    }

    /// True if an image built for `self` runs on `wanted`; an unset wanted variant matches any
    pub fn satisfies(&self, wanted: &Platform) -> bool {
        self.os == wanted.os
            && self.architecture == wanted.architecture
            && (wanted.variant.is_none() || self.variant == wanted.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Media type, size and digest of a registry artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    /// Set on image index entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// `sha256:<hex>` of `data`
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Raw manifest bytes with their media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub data: Bytes,
}

impl Manifest {
    pub fn new(media_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn digest(&self) -> String {
        sha256_digest(&self.data)
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            size: self.data.len() as u64,
            digest: self.digest(),
            platform: None,
        }
    }

    pub fn is_index(&self) -> bool {
        media_types::is_index(&self.media_type)
    }
}

#[derive(Deserialize)]
struct ImageLayout {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct IndexLayout {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// A single-platform image: its manifest plus whatever blob data is held locally.
///
/// Blobs not held locally are copied from the origin repository on push.
#[derive(Debug, Clone)]
pub struct Image {
    manifest: Manifest,
    config: Descriptor,
    layers: Vec<Descriptor>,
    blobs: HashMap<String, Bytes>,
    origin: Option<Repository>,
}

impl Image {
    pub fn from_manifest(manifest: Manifest) -> Result<Self> {
        if manifest.is_index() {
            return Err(RegistryError::protocol(
                "Reading image manifest",
                manifest.digest(),
                format!("media type {} is an image index", manifest.media_type),
            ));
        }
        let layout: ImageLayout = serde_json::from_slice(&manifest.data).map_err(|e| {
            RegistryError::protocol("Reading image manifest", manifest.digest(), e.to_string())
        })?;

        Ok(Self {
            manifest,
            config: layout.config,
            layers: layout.layers,
            blobs: HashMap::new(),
            origin: None,
        })
    }

    /// OCI image assembled from an in-memory config and gzipped layers
    pub fn from_blobs(config: impl Into<Bytes>, layers: Vec<Bytes>) -> Result<Self> {
        let config = config.into();
        let config_desc = Descriptor {
            media_type: media_types::OCI_CONFIG.to_string(),
            size: config.len() as u64,
            digest: sha256_digest(&config),
            platform: None,
        };
        let layer_descs: Vec<Descriptor> = layers
            .iter()
            .map(|layer| Descriptor {
                media_type: media_types::OCI_LAYER_GZIP.to_string(),
                size: layer.len() as u64,
                digest: sha256_digest(layer),
                platform: None,
            })
            .collect();

        let body = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": config_desc,
            "layers": layer_descs,
        }))
        .map_err(|e| RegistryError::protocol("Building image manifest", "<local>", e.to_string()))?;

        let mut image = Self::from_manifest(Manifest::new(media_types::OCI_MANIFEST, body))?;
        image = image.with_blob(config);
        for layer in layers {
            image = image.with_blob(layer);
        }
        Ok(image)
    }

    /// Hold `data` locally so pushes can upload it
    pub fn with_blob(mut self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        self.blobs.insert(sha256_digest(&data), data);
        self
    }

    /// Repository that blobs missing locally are copied from
    pub fn with_origin(mut self, origin: Repository) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn digest(&self) -> String {
        self.manifest.digest()
    }

    pub fn descriptor(&self) -> Descriptor {
        self.manifest.descriptor()
    }

    pub fn config(&self) -> &Descriptor {
        &self.config
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.layers
    }

    /// Config followed by layers
    pub fn blob_descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    pub fn blob(&self, digest: &str) -> Option<&Bytes> {
        self.blobs.get(digest)
    }

    /// Platform from the config blob, when it is held locally
    pub fn platform(&self) -> Option<Platform> {
        let config = self.blobs.get(&self.config.digest)?;
        serde_json::from_slice(config).ok()
    }

    pub fn origin(&self) -> Option<&Repository> {
        self.origin.as_ref()
    }
}

/// A multi-platform index plus any child images held locally
#[derive(Debug, Clone)]
pub struct ImageIndex {
    manifest: Manifest,
    children: Vec<Descriptor>,
    images: HashMap<String, Image>,
    origin: Option<Repository>,
}

impl ImageIndex {
    pub fn from_manifest(manifest: Manifest) -> Result<Self> {
        if !manifest.is_index() {
            return Err(RegistryError::protocol(
                "Reading image index",
                manifest.digest(),
                format!("media type {} is not an image index", manifest.media_type),
            ));
        }
        let layout: IndexLayout = serde_json::from_slice(&manifest.data).map_err(|e| {
            RegistryError::protocol("Reading image index", manifest.digest(), e.to_string())
        })?;

        Ok(Self {
            manifest,
            children: layout.manifests,
            images: HashMap::new(),
            origin: None,
        })
    }

    /// OCI index over `images`, which are pushed alongside it
    pub fn from_images(images: Vec<Image>) -> Result<Self> {
        let children: Vec<Descriptor> = images
            .iter()
            .map(|image| Descriptor {
                platform: image.platform(),
                ..image.descriptor()
            })
            .collect();
        let body = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_INDEX,
            "manifests": children,
        }))
        .map_err(|e| RegistryError::protocol("Building image index", "<local>", e.to_string()))?;

        let mut index = Self::from_manifest(Manifest::new(media_types::OCI_INDEX, body))?;
        for image in images {
            index = index.with_image(image);
        }
        Ok(index)
    }

    pub fn with_image(mut self, image: Image) -> Self {
        self.images.insert(image.digest(), image);
        self
    }

    pub fn with_origin(mut self, origin: Repository) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn digest(&self) -> String {
        self.manifest.digest()
    }

    pub fn descriptor(&self) -> Descriptor {
        self.manifest.descriptor()
    }

    pub fn children(&self) -> &[Descriptor] {
        &self.children
    }

    pub fn image(&self, digest: &str) -> Option<&Image> {
        self.images.get(digest)
    }

    /// First child built for `platform`
    pub fn child_for(&self, platform: &Platform) -> Option<&Descriptor> {
        self.children
            .iter()
            .find(|child| child.platform.as_ref().is_some_and(|p| p.satisfies(platform)))
    }

    pub fn origin(&self) -> Option<&Repository> {
        self.origin.as_ref()
    }
}

/// Distribution-API primitives used by the client
#[async_trait]
pub trait RegistryProtocol: Send + Sync {
    /// Manifest metadata without the body
    async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor>;

    async fn get_manifest(&self, reference: &Reference) -> Result<Manifest>;

    async fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<()>;

    async fn blob_exists(&self, repository: &Repository, digest: &str) -> Result<bool>;

    async fn get_blob(&self, repository: &Repository, digest: &str) -> Result<Bytes>;

    async fn put_blob(&self, repository: &Repository, digest: &str, data: Bytes) -> Result<()>;

    /// Cross-repository mount within one registry; `false` if the registry declined
    async fn mount_blob(&self, repository: &Repository, from: &Repository, digest: &str) -> Result<bool>;

    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>>;
}
