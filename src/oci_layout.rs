//! OCI Image Layout (C10): the on-disk `ContentStore` — `oci-layout`,
//! `index.json`, `blobs/<alg>/<hex>`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType, SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};

use crate::client::apply_artifact_type_filter;
use crate::content_store::{ContentStore, Referrers, Selector};
use crate::digest::{self, Digest};
use crate::error::{Error, Result};
use crate::model::{self, REF_NAME_ANNOTATION};

const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Serialize, Deserialize)]
struct OciLayoutFile {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// An on-disk OCI Image Layout rooted at `root`. Mutating calls write
/// through a temp file, renamed atomically into `blobs/<alg>/<hex>`
/// only after the digest matches; on mismatch the temp file is
/// unlinked, never left behind.
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Creates `root` (and `blobs/`) if absent, writing `oci-layout`
    /// and an empty `index.json`.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs"))?;
        let layout_path = root.join("oci-layout");
        if !layout_path.exists() {
            std::fs::write(
                &layout_path,
                serde_json::to_vec(&OciLayoutFile {
                    image_layout_version: LAYOUT_VERSION.to_string(),
                })?,
            )?;
        }
        let index_path = root.join("index.json");
        if !index_path.exists() {
            let empty = ImageIndexBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .media_type(MediaType::ImageIndex)
                .manifests(Vec::<Descriptor>::new())
                .build()
                .map_err(|e| Error::invariant(e.to_string()))?;
            std::fs::write(&index_path, serde_json::to_vec(&empty)?)?;
        }
        Ok(OciLayout { root })
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let layout_path = root.join("oci-layout");
        let raw: OciLayoutFile = serde_json::from_slice(&std::fs::read(&layout_path)?)?;
        if raw.image_layout_version != LAYOUT_VERSION {
            return Err(Error::invariant(format!(
                "unsupported image layout version {}",
                raw.image_layout_version
            )));
        }
        Ok(OciLayout { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.algorithm().as_str()).join(digest.hex())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn read_index(&self) -> Result<ImageIndex> {
        Ok(ImageIndex::from_reader(std::io::Cursor::new(std::fs::read(
            self.index_path(),
        )?))?)
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        atomic_write(&self.index_path(), &serde_json::to_vec(index)?)
    }

    /// Writes a blob via temp-file-then-rename; the digest must match
    /// the caller-supplied one.
    fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let computed = digest::digest_with(digest.algorithm(), data);
        if &computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                computed: computed.to_string(),
            });
        }
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(path.parent().unwrap())?;
        atomic_write(&path, data)
    }

    fn selector_to_descriptor(&self, selector: &Selector) -> Result<Descriptor> {
        let index = self.read_index()?;
        find_in_index(&index, selector)
            .ok_or_else(|| Error::invariant("no manifest matches the requested tag/digest"))
    }

    /// `pushManifest(ref, m)`: write the blob, then merge into
    /// `index.json` per `withNewManifests` (see `model::index_merge`).
    pub fn push_manifest_tagged(
        &self,
        tag: Option<&str>,
        media_type: &str,
        data: Bytes,
    ) -> Result<Descriptor> {
        let computed = digest::digest(&data);
        self.write_blob(&computed, &data)?;

        let oci_digest: oci_spec::image::Digest = (&computed).try_into()?;
        let mut builder = DescriptorBuilder::default()
            .media_type(media_type)
            .size(data.len() as u64)
            .digest(oci_digest);
        if let Some(tag) = tag {
            let mut annotations = std::collections::HashMap::new();
            annotations.insert(REF_NAME_ANNOTATION.to_string(), tag.to_string());
            builder = builder.annotations(annotations);
        }
        let descriptor = builder.build().map_err(|e| Error::invariant(e.to_string()))?;

        let index = self.read_index()?;
        let merged = model::index_merge(&index, descriptor.clone());
        self.write_index(&merged)?;
        Ok(descriptor)
    }
}

impl ContentStore for OciLayout {
    async fn push_blob(&self, digest: &Digest, data: Bytes) -> Result<()> {
        self.write_blob(digest, &data)
    }

    async fn fetch_blob(&self, digest: &Digest) -> Result<Option<Bytes>> {
        let path = self.blob_path(digest);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).exists())
    }

    async fn push_manifest(
        &self,
        selector: &Selector,
        media_type: &str,
        data: Bytes,
    ) -> Result<Descriptor> {
        self.push_manifest_tagged(selector.tag.as_deref(), media_type, data)
    }

    async fn get_manifest(&self, selector: &Selector) -> Result<Option<(Descriptor, Bytes)>> {
        let Ok(descriptor) = self.selector_to_descriptor(selector) else {
            return Ok(None);
        };
        let our_digest: Digest = descriptor.digest().try_into()?;
        let data = self.fetch_blob(&our_digest).await?;
        Ok(data.map(|d| (descriptor, d)))
    }

    async fn probe_descriptor(&self, selector: &Selector) -> Result<Option<Descriptor>> {
        Ok(self.selector_to_descriptor(selector).ok())
    }

    async fn get_referrers(&self, subject: &Digest, artifact_type: Option<&str>) -> Result<Referrers> {
        let index = self.read_index()?;
        let matching: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|m| {
                m.digest().to_string() != subject.to_string()
                    && manifest_subject_matches(self, m, subject)
            })
            .cloned()
            .collect();
        let (matching, filters_applied) = apply_artifact_type_filter(matching, artifact_type);
        Ok(Referrers {
            index: ImageIndexBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .media_type(MediaType::ImageIndex)
                .manifests(matching)
                .build()
                .map_err(|e| Error::invariant(e.to_string()))?,
            filters_applied,
        })
    }
}

/// Scans a manifest's own body for a `subject` pointing at `target`
/// (the referrers API walks one level: which stored manifests name
/// `target` as their subject).
fn manifest_subject_matches(layout: &OciLayout, descriptor: &Descriptor, target: &Digest) -> bool {
    let Ok(our_digest) = Digest::try_from(descriptor.digest()) else {
        return false;
    };
    let path = layout.blob_path(&our_digest);
    let Ok(data) = std::fs::read(path) else {
        return false;
    };
    let Ok(manifest) = oci_spec::image::ImageManifest::from_reader(std::io::Cursor::new(&data)) else {
        return false;
    };
    manifest
        .subject()
        .as_ref()
        .map(|s| s.digest().to_string() == target.to_string())
        .unwrap_or(false)
}

fn find_in_index(index: &ImageIndex, selector: &Selector) -> Option<Descriptor> {
    index.manifests().iter().find(|m| {
        if let Some(digest) = &selector.digest {
            return m.digest().to_string() == digest.to_string();
        }
        if let Some(tag) = &selector.tag {
            return m
                .annotations()
                .as_ref()
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .map(|r| r == tag)
                .unwrap_or(false);
        }
        false
    }).cloned()
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| Error::invariant("blob path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        OciLayout::create(dir.path()).unwrap();
        let layout = OciLayout::open(dir.path()).unwrap();
        assert!(layout.root().join("oci-layout").exists());
        assert!(layout.root().join("index.json").exists());
    }

    #[tokio::test]
    async fn test_push_and_fetch_blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        let d = digest::digest("hello");
        layout.push_blob(&d, Bytes::from_static(b"hello")).await.unwrap();
        let fetched = layout.fetch_blob(&d).await.unwrap().unwrap();
        assert_eq!(&fetched[..], b"hello");
    }

    #[tokio::test]
    async fn test_push_blob_rejects_mismatched_digest() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        let wrong = digest::digest("not-hello");
        let err = layout.push_blob(&wrong, Bytes::from_static(b"hello")).await;
        assert!(err.is_err());
        assert!(!layout.blob_path(&wrong).exists());
    }

    #[tokio::test]
    async fn test_push_manifest_tagged_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        let body = Bytes::from_static(b"{\"schemaVersion\":2}");
        let descriptor = layout
            .push_manifest_tagged(Some("latest"), "application/vnd.oci.image.manifest.v1+json", body)
            .unwrap();
        let selector = Selector::from_tag("latest");
        let found = layout.probe_descriptor(&selector).await.unwrap().unwrap();
        assert_eq!(found.digest().to_string(), descriptor.digest().to_string());
    }

    #[tokio::test]
    async fn test_get_referrers_filters_by_artifact_type() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();

        let subject_body = Bytes::from_static(b"{\"schemaVersion\":2,\"mediaType\":\"application/vnd.oci.image.manifest.v1+json\",\"config\":{\"mediaType\":\"application/vnd.oci.empty.v1+json\",\"digest\":\"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a\",\"size\":2},\"layers\":[]}");
        let subject = layout
            .push_manifest_tagged(Some("latest"), "application/vnd.oci.image.manifest.v1+json", subject_body)
            .unwrap();
        let subject_digest: Digest = subject.digest().try_into().unwrap();

        let make_referrer = |artifact_type: &str| -> Bytes {
            Bytes::from(format!(
                "{{\"schemaVersion\":2,\"mediaType\":\"application/vnd.oci.image.manifest.v1+json\",\"artifactType\":\"{artifact_type}\",\"config\":{{\"mediaType\":\"application/vnd.oci.empty.v1+json\",\"digest\":\"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a\",\"size\":2}},\"layers\":[],\"subject\":{{\"mediaType\":\"application/vnd.oci.image.manifest.v1+json\",\"digest\":\"{subject_digest}\",\"size\":1}}}}"
            ))
        };
        layout
            .push_manifest_tagged(None, "application/vnd.oci.image.manifest.v1+json", make_referrer("application/vnd.example.sbom"))
            .unwrap();
        layout
            .push_manifest_tagged(None, "application/vnd.oci.image.manifest.v1+json", make_referrer("application/vnd.example.signature"))
            .unwrap();

        let all = layout.get_referrers(&subject_digest, None).await.unwrap();
        assert_eq!(all.index.manifests().len(), 2);
        assert!(all.filters_applied.is_none());

        let filtered = layout
            .get_referrers(&subject_digest, Some("application/vnd.example.sbom"))
            .await
            .unwrap();
        assert_eq!(filtered.index.manifests().len(), 1);
        assert_eq!(filtered.filters_applied.as_deref(), Some("application/vnd.example.sbom"));
    }

    #[tokio::test]
    async fn test_index_merge_keeps_single_ref_holder() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(dir.path()).unwrap();
        layout
            .push_manifest_tagged(Some("latest"), "application/vnd.oci.image.manifest.v1+json", Bytes::from_static(b"{\"a\":1}"))
            .unwrap();
        layout
            .push_manifest_tagged(Some("latest"), "application/vnd.oci.image.manifest.v1+json", Bytes::from_static(b"{\"a\":2}"))
            .unwrap();
        let index = layout.read_index().unwrap();
        let with_ref = index
            .manifests()
            .iter()
            .filter(|m| {
                m.annotations()
                    .as_ref()
                    .map(|a| a.contains_key(REF_NAME_ANNOTATION))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(with_ref, 1);
        assert_eq!(index.manifests().len(), 2);
    }
}
