//! Manifest/index data model: thin helpers atop `oci_spec::image` for
//! the empty-manifest constant and the copy-on-write index-merge rule.

use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageManifest, ImageManifestBuilder, MediaType,
    SCHEMA_VERSION,
};

use crate::digest;
use crate::error::{Error, Result};
use crate::reference::Platform as OurPlatform;

pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
pub const CONTENT_UNPACK_ANNOTATION: &str = "io.deis.oras.content.unpack";
pub const CONTENT_DIGEST_ANNOTATION: &str = "io.deis.oras.content.digest";

/// `{}`, the canonical empty config blob (2 bytes); its digest is fixed
/// since its content never varies.
pub const EMPTY_CONFIG_BYTES: &[u8] = b"{}";

pub fn empty_config_descriptor() -> Result<Descriptor> {
    let d = digest::digest(EMPTY_CONFIG_BYTES);
    let oci_digest: oci_spec::image::Digest = (&d).try_into()?;
    Ok(DescriptorBuilder::default()
        .media_type(MediaType::EmptyJSON)
        .size(EMPTY_CONFIG_BYTES.len() as u64)
        .digest(oci_digest)
        .build()
        .map_err(|e| Error::invariant(e.to_string()))?)
}

/// A manifest with an empty config and no layers; callers attach
/// layers/config via `oci_spec`'s own builder before pushing.
pub fn empty_manifest() -> Result<ImageManifest> {
    let config = empty_config_descriptor()?;
    Ok(ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(Vec::<Descriptor>::new())
        .build()
        .map_err(|e| Error::invariant(e.to_string()))?)
}

pub fn to_oci_platform(p: &OurPlatform) -> oci_spec::image::Platform {
    let mut builder = oci_spec::image::PlatformBuilder::default()
        .os(oci_spec::image::Os::Other(p.os.clone()))
        .architecture(oci_spec::image::Arch::Other(p.architecture.clone()));
    if let Some(variant) = &p.variant {
        builder = builder.variant(variant.clone());
    }
    if let Some(os_version) = &p.os_version {
        builder = builder.os_version(os_version.clone());
    }
    if !p.os_features.is_empty() {
        builder = builder.os_features(p.os_features.clone());
    }
    if !p.features.is_empty() {
        builder = builder.features(p.features.clone());
    }
    builder.build().expect("required fields set")
}

pub fn from_oci_platform(p: &oci_spec::image::Platform) -> OurPlatform {
    OurPlatform {
        os: p.os().to_string(),
        architecture: p.architecture().to_string(),
        variant: p.variant().clone(),
        os_version: p.os_version().clone(),
        os_features: p.os_features().clone().unwrap_or_default(),
        features: p.features().clone().unwrap_or_default(),
    }
}

/// Copy-on-write index merge (§4.8/§4.10 `withNewManifests`):
/// - An existing entry with the same digest is kept as-is (idempotent).
/// - Otherwise the new descriptor is appended.
/// - If the new descriptor carries a `ref.name` annotation, that
///   annotation is removed from any older entry that had it (only one
///   entry may hold a given ref name at a time); entries without an
///   explicit ref on the incoming descriptor are left untouched, per
///   the decision recorded for this open question.
pub fn index_merge(index: &ImageIndex, new_descriptor: Descriptor) -> ImageIndex {
    let incoming_ref = ref_name_of(&new_descriptor);
    let mut manifests: Vec<Descriptor> = index.manifests().clone();

    if manifests.iter().any(|m| m.digest() == new_descriptor.digest()) {
        return index.clone();
    }

    if let Some(incoming_ref) = &incoming_ref {
        for m in manifests.iter_mut() {
            if ref_name_of(m).as_deref() == Some(incoming_ref.as_str()) {
                strip_ref_annotation(m);
            }
        }
    }

    manifests.push(new_descriptor);

    let mut rebuilt = index.clone();
    rebuilt.set_manifests(manifests);
    rebuilt
}

fn ref_name_of(descriptor: &Descriptor) -> Option<String> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .cloned()
}

fn strip_ref_annotation(descriptor: &mut Descriptor) {
    if let Some(mut annotations) = descriptor.annotations().clone() {
        annotations.remove(REF_NAME_ANNOTATION);
        descriptor.set_annotations(Some(annotations));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::ImageIndexBuilder;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_digest_matches_s3() {
        let d = empty_config_descriptor().unwrap();
        assert_eq!(
            d.digest().to_string(),
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        assert_eq!(d.size(), 2);
    }

    fn descriptor_with_ref(digest_hex: &str, ref_name: Option<&str>) -> Descriptor {
        let digest: oci_spec::image::Digest = format!("sha256:{digest_hex}").parse().unwrap();
        let mut builder = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .size(1u64)
            .digest(digest);
        if let Some(r) = ref_name {
            let mut m = HashMap::new();
            m.insert(REF_NAME_ANNOTATION.to_string(), r.to_string());
            builder = builder.annotations(m);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_index_merge_idempotent_on_identical_digest() {
        let hex = "a".repeat(64);
        let d = descriptor_with_ref(&hex, Some("latest"));
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![d.clone()])
            .build()
            .unwrap();
        let merged = index_merge(&index, d);
        assert_eq!(merged.manifests().len(), 1);
    }

    #[test]
    fn test_index_merge_moves_ref_annotation() {
        let hex_a = "a".repeat(64);
        let hex_b = "b".repeat(64);
        let old = descriptor_with_ref(&hex_a, Some("latest"));
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![old])
            .build()
            .unwrap();
        let new = descriptor_with_ref(&hex_b, Some("latest"));
        let merged = index_merge(&index, new);
        assert_eq!(merged.manifests().len(), 2);
        assert!(ref_name_of(&merged.manifests()[0]).is_none());
        assert_eq!(ref_name_of(&merged.manifests()[1]).as_deref(), Some("latest"));
    }

    #[test]
    fn test_index_merge_preserves_non_ref_annotations() {
        let hex_a = "a".repeat(64);
        let hex_b = "b".repeat(64);
        let mut old = descriptor_with_ref(&hex_a, Some("latest"));
        let mut annotations = old.annotations().clone().unwrap();
        annotations.insert("custom".into(), "value".into());
        old.set_annotations(Some(annotations));
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![old])
            .build()
            .unwrap();
        let new = descriptor_with_ref(&hex_b, Some("latest"));
        let merged = index_merge(&index, new);
        let preserved = merged.manifests()[0].annotations().as_ref().unwrap();
        assert_eq!(preserved.get("custom"), Some(&"value".to_string()));
        assert!(!preserved.contains_key(REF_NAME_ANNOTATION));
    }
}
