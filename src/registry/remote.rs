//! Content movement on top of [`RegistryProtocol`] primitives

use futures::future::{BoxFuture, FutureExt, try_join_all};
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::reference::{Digest, Reference, Repository, Tag};
use crate::registry::protocol::{Descriptor, Image, ImageIndex, Platform, RegistryProtocol};

/// Image at `reference`; an index resolves to its child built for `platform`
pub async fn get_image(
    protocol: &dyn RegistryProtocol,
    reference: &Reference,
    platform: &Platform,
) -> Result<Image> {
    let manifest = protocol.get_manifest(reference).await?;
    let origin = reference.repository().clone();
    if !manifest.is_index() {
        return Ok(Image::from_manifest(manifest)?.with_origin(origin));
    }

    let index = ImageIndex::from_manifest(manifest)?;
    let Some(child) = index.child_for(platform) else {
        return Err(RegistryError::protocol(
            "Resolving image",
            reference.to_string(),
            format!("index has no manifest for platform {}", platform),
        ));
    };
    debug!(reference = %reference, %platform, child = %child.digest, "resolved index to platform image");

    let child_ref = Reference::Digest(reference.with_digest(&child.digest));
    let manifest = protocol.get_manifest(&child_ref).await?;
    Ok(Image::from_manifest(manifest)?.with_origin(origin))
}

pub async fn get_index(protocol: &dyn RegistryProtocol, reference: &Reference) -> Result<ImageIndex> {
    let manifest = protocol.get_manifest(reference).await?;
    Ok(ImageIndex::from_manifest(manifest)?.with_origin(reference.repository().clone()))
}

/// Push every blob the image references, then its manifest
pub async fn write_image(protocol: &dyn RegistryProtocol, reference: &Reference, image: &Image) -> Result<()> {
    let repository = reference.repository();
    try_join_all(
        image
            .blob_descriptors()
            .map(|desc| ensure_blob(protocol, repository, desc, image)),
    )
    .await?;

    protocol.put_manifest(reference, image.manifest()).await?;
    info!(reference = %reference, digest = %image.digest(), "image written");
    Ok(())
}

/// Push child manifests the registry lacks, then the index manifest
pub fn write_index<'a>(
    protocol: &'a dyn RegistryProtocol,
    reference: &'a Reference,
    index: &'a ImageIndex,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let repository = reference.repository();
        for child in index.children() {
            let child_ref = Reference::Digest(reference.with_digest(&child.digest));

            if let Some(image) = index.image(&child.digest) {
                write_image(protocol, &child_ref, image).await?;
                continue;
            }
            if manifest_exists(protocol, &child_ref).await? {
                debug!(child = %child.digest, "child manifest already present");
                continue;
            }

            let Some(origin) = index.origin() else {
                return Err(missing_content(repository, child, "manifest"));
            };
            copy_child(protocol, origin, &child_ref, child).await?;
        }

        protocol.put_manifest(reference, index.manifest()).await?;
        info!(reference = %reference, digest = %index.digest(), "image index written");
        Ok(())
    }
    .boxed()
}

/// Point `tag` at the manifest `source` resolves to
pub async fn tag(protocol: &dyn RegistryProtocol, tag: &Tag, source: &Digest) -> Result<()> {
    let manifest = protocol.get_manifest(&Reference::Digest(source.clone())).await?;
    protocol.put_manifest(&Reference::Tag(tag.clone()), &manifest).await?;
    info!(tag = %tag, source = %source, "tag written");
    Ok(())
}

async fn copy_child(
    protocol: &dyn RegistryProtocol,
    origin: &Repository,
    child_ref: &Reference,
    child: &Descriptor,
) -> Result<()> {
    let source = Reference::Digest(origin.at_digest(&child.digest));
    let manifest = protocol.get_manifest(&source).await?;
    if manifest.is_index() {
        let nested = ImageIndex::from_manifest(manifest)?.with_origin(origin.clone());
        write_index(protocol, child_ref, &nested).await
    } else {
        let image = Image::from_manifest(manifest)?.with_origin(origin.clone());
        write_image(protocol, child_ref, &image).await
    }
}

async fn manifest_exists(protocol: &dyn RegistryProtocol, reference: &Reference) -> Result<bool> {
    match protocol.head_manifest(reference).await {
        Ok(_) => Ok(true),
        Err(err) if err.status() == Some(404) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Make `desc` present in `repository`: skip, upload local data, mount, or stream from origin
async fn ensure_blob(
    protocol: &dyn RegistryProtocol,
    repository: &Repository,
    desc: &Descriptor,
    image: &Image,
) -> Result<()> {
    if protocol.blob_exists(repository, &desc.digest).await? {
        debug!(digest = %desc.digest, "blob already present");
        return Ok(());
    }

    if let Some(data) = image.blob(&desc.digest) {
        return protocol.put_blob(repository, &desc.digest, data.clone()).await;
    }

    let Some(origin) = image.origin() else {
        return Err(missing_content(repository, desc, "blob"));
    };

    if origin.registry().host() == repository.registry().host() && origin != repository {
        if protocol.mount_blob(repository, origin, &desc.digest).await? {
            debug!(digest = %desc.digest, from = %origin, "blob mounted");
            return Ok(());
        }
    }

    let data = protocol.get_blob(origin, &desc.digest).await?;
    protocol.put_blob(repository, &desc.digest, data).await
}

fn missing_content(repository: &Repository, desc: &Descriptor, what: &str) -> RegistryError {
    RegistryError::protocol(
        format!("Pushing {}", what),
        format!("{}@{}", repository, desc.digest),
        "content is neither held locally nor available from an origin repository",
    )
}
