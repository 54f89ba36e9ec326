//! The capability set `Registry` and `OCILayout` both implement; the
//! copy engine (C11) is generic over this trait rather than over a
//! concrete backend.

use bytes::Bytes;
use oci_spec::image::{Descriptor, ImageIndex};

use crate::digest::Digest;
use crate::error::Result;

/// A caller-provided reference into the dest/source of a `ContentStore`
/// operation: a tag, a digest, or both. Backends resolve it to the
/// selector they need (`Registry` via `ContainerRef`, `OCILayout` via
/// `LayoutRef`) before calling in; this trait stays backend-agnostic.
#[derive(Debug, Clone)]
pub struct Selector {
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl Selector {
    pub fn from_tag(tag: impl Into<String>) -> Self {
        Selector {
            tag: Some(tag.into()),
            digest: None,
        }
    }

    pub fn from_digest(digest: Digest) -> Self {
        Selector {
            tag: None,
            digest: Some(digest),
        }
    }
}

/// The result of `get_referrers`: the index itself, plus whether an
/// `artifact_type` filter (if one was requested) was actually applied
/// before the caller saw it. A registry reports this via the
/// `OCI-Filters-Applied` response header; a filter request it does not
/// honor must still be applied by the caller. `OciLayout` always
/// applies the filter itself, since there is no server in the loop.
#[derive(Debug, Clone)]
pub struct Referrers {
    pub index: ImageIndex,
    pub filters_applied: Option<String>,
}

/// Implementations are generic parameters of the copy engine (C11),
/// never trait objects, so this can stay a plain native `async fn`
/// trait rather than pulling in `async-trait`.
pub trait ContentStore: Send + Sync {
    /// Uploads `data`, whose digest must equal `digest`, unless it
    /// already exists (checked via `exists`).
    async fn push_blob(&self, digest: &Digest, data: Bytes) -> Result<()>;

    /// Downloads and digest-verifies a blob; `None` when absent.
    async fn fetch_blob(&self, digest: &Digest) -> Result<Option<Bytes>>;

    /// `true` iff a blob with this digest is already present.
    async fn exists(&self, digest: &Digest) -> Result<bool>;

    /// Pushes a manifest or index body under `selector`, returning its
    /// descriptor (digest, size, media type).
    async fn push_manifest(
        &self,
        selector: &Selector,
        media_type: &str,
        data: Bytes,
    ) -> Result<Descriptor>;

    /// Fetches a manifest/index body by tag or digest.
    async fn get_manifest(&self, selector: &Selector) -> Result<Option<(Descriptor, Bytes)>>;

    /// `HEAD`-equivalent: media type, size, digest without the body.
    async fn probe_descriptor(&self, selector: &Selector) -> Result<Option<Descriptor>>;

    /// Manifests referring to `subject` (the referrers API, or its
    /// tag-schema fallback), optionally narrowed to `artifact_type`.
    async fn get_referrers(&self, subject: &Digest, artifact_type: Option<&str>) -> Result<Referrers>;
}
