//! Copy engine (C11): replicates a manifest (and, if requested, its
//! layers/config and referrers) from one `ContentStore` to another,
//! byte-for-byte, skipping anything the destination already has.

use std::collections::HashSet;

use bytes::Bytes;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};

use crate::client::Registry;
use crate::content_store::{ContentStore, Selector};
use crate::digest::Digest;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Also walk and copy every manifest in the source's referrers
    /// chain for the copied subject (§4.11 recursive copy).
    pub recursive: bool,
}

/// Copies the manifest or index selected by `source_selector` from
/// `source` to `dest` under `dest_selector`, plus every blob it
/// references. Generic over any two `ContentStore`s (registry↔registry,
/// registry↔layout, layout↔layout).
pub async fn copy(
    source: &impl ContentStore,
    dest: &impl ContentStore,
    source_selector: &Selector,
    dest_selector: &Selector,
    options: &CopyOptions,
) -> Result<Descriptor> {
    let (descriptor, body) = source
        .get_manifest(source_selector)
        .await?
        .ok_or_else(|| Error::invariant("source manifest not found"))?;

    if is_index_media_type(descriptor.media_type()) {
        let index = ImageIndex::from_reader(std::io::Cursor::new(&body))?;
        for member in index.manifests() {
            copy_index_member(source, dest, member).await?;
        }
    } else {
        copy_manifest_blobs(source, dest, &body).await?;
    }

    let pushed = dest
        .push_manifest(dest_selector, &descriptor.media_type().to_string(), body)
        .await?;

    if options.recursive {
        let root_digest: Digest = pushed.digest().try_into()?;
        copy_referrer_chain(source, dest, root_digest).await?;
    }

    Ok(pushed)
}

/// One level of index membership: a plain manifest addressed by digest,
/// pushed at dest under that same digest (no tag).
async fn copy_index_member(
    source: &impl ContentStore,
    dest: &impl ContentStore,
    member: &Descriptor,
) -> Result<()> {
    let digest: Digest = member.digest().try_into()?;
    if dest
        .probe_descriptor(&Selector::from_digest(digest.clone()))
        .await?
        .is_some()
    {
        return Ok(());
    }
    let (desc, body) = source
        .get_manifest(&Selector::from_digest(digest.clone()))
        .await?
        .ok_or_else(|| Error::invariant(format!("index member {digest} missing from source")))?;
    copy_manifest_blobs(source, dest, &body).await?;
    dest.push_manifest(
        &Selector::from_digest(digest),
        &desc.media_type().to_string(),
        body,
    )
    .await?;
    Ok(())
}

/// Copies a manifest's config and layer blobs. Blob-exists-skip state
/// machine: `exists` on dest short-circuits the fetch from source.
async fn copy_manifest_blobs(
    source: &impl ContentStore,
    dest: &impl ContentStore,
    body: &Bytes,
) -> Result<()> {
    let manifest = ImageManifest::from_reader(std::io::Cursor::new(body))?;
    copy_blob(source, dest, manifest.config()).await?;
    for layer in manifest.layers() {
        copy_blob(source, dest, layer).await?;
    }
    Ok(())
}

async fn copy_blob(
    source: &impl ContentStore,
    dest: &impl ContentStore,
    descriptor: &Descriptor,
) -> Result<()> {
    let digest: Digest = descriptor.digest().try_into()?;
    if dest.exists(&digest).await? {
        return Ok(());
    }
    let data = source
        .fetch_blob(&digest)
        .await?
        .ok_or_else(|| Error::invariant(format!("source missing blob {digest}")))?;
    dest.push_blob(&digest, data).await
}

/// Walks referrers breadth-first from `root`, copying every manifest
/// found (and its own referrers) that the destination doesn't already
/// have. Referrer manifests are never indexes, so this never needs to
/// recurse into `copy_index_member`.
async fn copy_referrer_chain(
    source: &impl ContentStore,
    dest: &impl ContentStore,
    root: Digest,
) -> Result<()> {
    let mut seen = HashSet::new();
    seen.insert(root.to_string());
    let mut queue = vec![root];

    while let Some(subject) = queue.pop() {
        let referrers = source.get_referrers(&subject, None).await?;
        for referrer in referrers.index.manifests() {
            let digest: Digest = referrer.digest().try_into()?;
            if !seen.insert(digest.to_string()) {
                continue;
            }
            if dest
                .probe_descriptor(&Selector::from_digest(digest.clone()))
                .await?
                .is_none()
            {
                let (desc, body) = source
                    .get_manifest(&Selector::from_digest(digest.clone()))
                    .await?
                    .ok_or_else(|| Error::invariant(format!("referrer {digest} missing from source")))?;
                copy_manifest_blobs(source, dest, &body).await?;
                dest.push_manifest(
                    &Selector::from_digest(digest.clone()),
                    &desc.media_type().to_string(),
                    body,
                )
                .await?;
            }
            queue.push(digest);
        }
    }
    Ok(())
}

fn is_index_media_type(media_type: &MediaType) -> bool {
    matches!(media_type, MediaType::ImageIndex)
        || matches!(media_type, MediaType::Other(s) if s == "application/vnd.docker.distribution.manifest.list.v2+json")
}

/// Registry-to-registry copy that mounts blobs across repositories
/// instead of downloading and re-uploading them when both sides share
/// a host (§4.8 `crossRepoMount`); falls back to the generic path
/// otherwise.
pub async fn copy_registry_to_registry(
    source: &Registry,
    dest: &Registry,
    source_selector: &Selector,
    dest_selector: &Selector,
    options: &CopyOptions,
) -> Result<Descriptor> {
    if source.host() != dest.host() {
        return copy(source, dest, source_selector, dest_selector, options).await;
    }

    let (descriptor, body) = source
        .get_manifest(source_selector)
        .await?
        .ok_or_else(|| Error::invariant("source manifest not found"))?;

    if is_index_media_type(descriptor.media_type()) {
        let index = ImageIndex::from_reader(std::io::Cursor::new(&body))?;
        for member in index.manifests() {
            let digest: Digest = member.digest().try_into()?;
            if dest
                .probe_descriptor(&Selector::from_digest(digest.clone()))
                .await?
                .is_some()
            {
                continue;
            }
            let (member_desc, member_body) = source
                .get_manifest(&Selector::from_digest(digest.clone()))
                .await?
                .ok_or_else(|| Error::invariant(format!("index member {digest} missing from source")))?;
            mount_manifest_blobs(source, dest, &member_body).await?;
            dest.push_manifest(
                &Selector::from_digest(digest),
                &member_desc.media_type().to_string(),
                member_body,
            )
            .await?;
        }
    } else {
        mount_manifest_blobs(source, dest, &body).await?;
    }

    let pushed = dest
        .push_manifest(dest_selector, &descriptor.media_type().to_string(), body)
        .await?;

    if options.recursive {
        let root_digest: Digest = pushed.digest().try_into()?;
        copy_referrer_chain(source, dest, root_digest).await?;
    }

    Ok(pushed)
}

async fn mount_manifest_blobs(source: &Registry, dest: &Registry, body: &Bytes) -> Result<()> {
    let manifest = ImageManifest::from_reader(std::io::Cursor::new(body))?;
    mount_one(source, dest, manifest.config()).await?;
    for layer in manifest.layers() {
        mount_one(source, dest, layer).await?;
    }
    Ok(())
}

async fn mount_one(source: &Registry, dest: &Registry, descriptor: &Descriptor) -> Result<()> {
    let digest: Digest = descriptor.digest().try_into()?;
    if dest.exists(&digest).await? {
        return Ok(());
    }
    if dest.mount_blob(&digest, source.name()).await? {
        return Ok(());
    }
    let data = source
        .fetch_blob(&digest)
        .await?
        .ok_or_else(|| Error::invariant(format!("source missing blob {digest}")))?;
    dest.push_blob(&digest, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_layout::OciLayout;

    #[tokio::test]
    async fn test_copy_single_manifest_between_layouts() {
        let src_dir = tempfile::tempdir().unwrap();
        let source = OciLayout::create(src_dir.path()).unwrap();
        let config = crate::model::empty_config_descriptor().unwrap();
        source
            .push_blob(
                &Digest::try_from(config.digest()).unwrap(),
                Bytes::from_static(crate::model::EMPTY_CONFIG_BYTES),
            )
            .await
            .unwrap();
        let layer_bytes = Bytes::from_static(b"layer-data");
        let layer_digest = crate::digest::digest(&layer_bytes);
        source.push_blob(&layer_digest, layer_bytes.clone()).await.unwrap();

        let layer_oci_digest: oci_spec::image::Digest = (&layer_digest).try_into().unwrap();
        let layer_descriptor = oci_spec::image::DescriptorBuilder::default()
            .media_type(MediaType::ImageLayer)
            .size(layer_bytes.len() as u64)
            .digest(layer_oci_digest)
            .build()
            .unwrap();
        let manifest = oci_spec::image::ImageManifestBuilder::default()
            .schema_version(oci_spec::image::SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(vec![layer_descriptor])
            .build()
            .unwrap();
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());

        let src_selector = Selector::from_tag("v1");
        source
            .push_manifest_tagged(Some("v1"), "application/vnd.oci.image.manifest.v1+json", manifest_bytes)
            .unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dest = OciLayout::create(dst_dir.path()).unwrap();
        let dst_selector = Selector::from_tag("v1");

        let copied = copy(&source, &dest, &src_selector, &dst_selector, &CopyOptions::default())
            .await
            .unwrap();

        let (_, dest_manifest_bytes) = dest.get_manifest(&dst_selector).await.unwrap().unwrap();
        assert_eq!(dest_manifest_bytes.len(), copied.size() as usize);

        let fetched_layer = dest.fetch_blob(&layer_digest).await.unwrap().unwrap();
        assert_eq!(fetched_layer, layer_bytes);
    }

    #[tokio::test]
    async fn test_copy_skips_blob_already_at_destination() {
        let src_dir = tempfile::tempdir().unwrap();
        let source = OciLayout::create(src_dir.path()).unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let dest = OciLayout::create(dst_dir.path()).unwrap();

        let data = Bytes::from_static(b"shared-blob");
        let digest = crate::digest::digest(&data);
        source.push_blob(&digest, data.clone()).await.unwrap();
        dest.push_blob(&digest, data.clone()).await.unwrap();

        copy_blob(&source, &dest, &{
            let oci_digest: oci_spec::image::Digest = (&digest).try_into().unwrap();
            oci_spec::image::DescriptorBuilder::default()
                .media_type(MediaType::ImageLayer)
                .size(data.len() as u64)
                .digest(oci_digest)
                .build()
                .unwrap()
        })
        .await
        .unwrap();

        let fetched = dest.fetch_blob(&digest).await.unwrap().unwrap();
        assert_eq!(fetched, data);
    }
}
