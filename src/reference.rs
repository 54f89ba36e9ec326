//! Reference model (C2): container references, layout references, and
//! platform descriptors.

use std::fmt;

use crate::digest::Digest;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty reference")]
    Empty,
    #[error("empty repository in reference {0:?}")]
    EmptyRepository(String),
    #[error("bad digest in reference {0:?}: {1}")]
    BadDigest(String, String),
}

/// `docker.io` is an alias for the real API host.
pub const DOCKER_IO: &str = "docker.io";
pub const DOCKER_API_REGISTRY: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// An immutable `(registry, namespace?, repository, tag?, digest?)`
/// tuple. Mutators return new instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    registry: String,
    namespace: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
    /// True when the input string had no dotted/colonned/`localhost`
    /// registry component; resolution to an effective registry is
    /// deferred to the registries-conf resolver (C3).
    unqualified: bool,
}

impl ContainerRef {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn is_unqualified(&self) -> bool {
        self.unqualified
    }

    /// The full `namespace/repository` path used in `/v2/<name>/...`.
    pub fn name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.repository),
            None => self.repository.clone(),
        }
    }

    /// The registry host to use when actually making requests:
    /// `docker.io` maps to `registry-1.docker.io`.
    pub fn api_registry(&self) -> &str {
        if self.registry == DOCKER_IO {
            DOCKER_API_REGISTRY
        } else {
            &self.registry
        }
    }

    /// `tag` if present, else `digest`; operations needing a unique
    /// identity prefer `digest`.
    pub fn unique_selector(&self) -> Option<String> {
        match (&self.tag, &self.digest) {
            (_, Some(d)) => Some(d.to_string()),
            (Some(t), None) => Some(t.clone()),
            (None, None) => None,
        }
    }

    pub fn with_registry(&self, registry: impl Into<String>) -> Self {
        let mut r = self.clone();
        r.registry = registry.into();
        r.unqualified = false;
        r
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        let mut r = self.clone();
        r.tag = Some(tag.into());
        r
    }

    pub fn with_digest(&self, digest: Digest) -> Self {
        let mut r = self.clone();
        r.digest = Some(digest);
        r
    }

    pub fn without_digest(&self) -> Self {
        let mut r = self.clone();
        r.digest = None;
        r
    }

    /// `/v2/<name>/manifests/<digest|tag>`.
    pub fn manifests_path(&self) -> Result<String, Error> {
        let selector = self
            .unique_selector()
            .ok_or_else(|| Error::EmptyRepository(self.name()))?;
        Ok(format!("/v2/{}/manifests/{}", self.name(), selector))
    }

    /// `/v2/<name>/tags/list`.
    pub fn tags_path(&self) -> String {
        format!("/v2/{}/tags/list", self.name())
    }

    /// `/v2/<name>/blobs/<digest>`; requires a digest.
    pub fn blobs_path(&self) -> Result<String, Error> {
        let digest = self
            .digest
            .as_ref()
            .ok_or_else(|| Error::EmptyRepository(self.name()))?;
        Ok(format!("/v2/{}/blobs/{}", self.name(), digest))
    }

    /// `/v2/<name>/referrers/<digest>`.
    pub fn referrers_path(&self, subject: &Digest) -> String {
        format!("/v2/{}/referrers/{}", self.name(), subject)
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ContainerRef {
    type Err = Error;

    /// `[registry "/"] (namespace "/")* repository [":" tag] ["@" algorithm ":" hex]`
    ///
    /// A left component is a registry iff it contains `.` or `:` or
    /// equals `localhost`; the last `/`-separated component before any
    /// `:` or `@` is the repository.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Empty);
        }

        let (before_digest, digest_str) = match s.split_once('@') {
            Some((before, d)) => (before, Some(d)),
            None => (s, None),
        };

        let digest = digest_str
            .map(|d| d.parse::<Digest>())
            .transpose()
            .map_err(|e| Error::BadDigest(s.to_string(), e.to_string()))?;

        // split off a tag: the last ':' after the last '/' is a tag
        // separator (a registry's ':' port lives before the last '/').
        let last_slash = before_digest.rfind('/');
        let (path_part, tag) = match before_digest.rfind(':') {
            Some(colon_idx) if last_slash.map(|si| colon_idx > si).unwrap_or(true) => (
                &before_digest[..colon_idx],
                Some(before_digest[colon_idx + 1..].to_string()),
            ),
            _ => (before_digest, None),
        };

        if path_part.is_empty() {
            return Err(Error::Empty);
        }

        let mut segments: Vec<&str> = path_part.split('/').collect();
        let first = segments[0];
        let is_registry = first.contains('.') || first.contains(':') || first == "localhost";

        let registry = if is_registry && segments.len() > 1 {
            segments.remove(0).to_string()
        } else {
            DOCKER_IO.to_string()
        };
        let unqualified = !(is_registry && segments.len() > 1);

        let repository = segments
            .pop()
            .ok_or_else(|| Error::EmptyRepository(s.to_string()))?
            .to_string();
        if repository.is_empty() {
            return Err(Error::EmptyRepository(s.to_string()));
        }
        let namespace = if segments.is_empty() {
            None
        } else {
            Some(segments.join("/"))
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (t, _) => t.clone(),
        };

        Ok(ContainerRef {
            registry,
            namespace,
            repository,
            tag,
            digest,
            unqualified,
        })
    }
}

/// `(folder, tag?, digest?)` for referring into an on-disk OCI Image
/// Layout. Same tag/digest distinction as [`ContainerRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRef {
    folder: std::path::PathBuf,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl LayoutRef {
    pub fn new(folder: impl Into<std::path::PathBuf>) -> Self {
        LayoutRef {
            folder: folder.into(),
            tag: None,
            digest: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn folder(&self) -> &std::path::Path {
        &self.folder
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn unique_selector(&self) -> Option<String> {
        match (&self.tag, &self.digest) {
            (_, Some(d)) => Some(d.to_string()),
            (Some(t), None) => Some(t.clone()),
            (None, None) => None,
        }
    }
}

/// `(os, architecture, variant?, osVersion?, osFeatures?, features?)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
    pub os_version: Option<String>,
    pub os_features: Vec<String>,
    pub features: Vec<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Platform {
            os: os.into(),
            architecture: architecture.into(),
            ..Default::default()
        }
    }

    /// Equal os, architecture, variant. `strict=false` (default) ignores
    /// `os_version`; `strict=true` compares it too. Wildcard
    /// "unknown/unknown" is distinct from any real platform (this falls
    /// out of plain equality: it only matches another "unknown/unknown").
    pub fn matches(&self, other: &Platform, strict: bool) -> bool {
        if self.os != other.os || self.architecture != other.architecture {
            return false;
        }
        if self.variant != other.variant {
            return false;
        }
        if strict && self.os_version != other.os_version {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s1_shape() {
        let s = "docker.io/library/foo/hello-world:latest";
        let r: ContainerRef = s.parse().unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.api_registry(), "registry-1.docker.io");
        assert_eq!(r.namespace(), Some("library/foo"));
        assert_eq!(r.repository(), "hello-world");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_unqualified_bare_name() {
        let r: ContainerRef = "alpine".parse().unwrap();
        assert!(r.is_unqualified());
        assert_eq!(r.repository(), "alpine");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn test_localhost_is_a_registry() {
        let r: ContainerRef = "localhost/x".parse().unwrap();
        assert_eq!(r.registry(), "localhost");
        assert!(!r.is_unqualified());
        assert_eq!(r.repository(), "x");
    }

    #[test]
    fn test_single_segment_registry_shaped_name_is_still_unqualified() {
        let r: ContainerRef = "my.app".parse().unwrap();
        assert_eq!(r.registry(), DOCKER_IO);
        assert!(r.is_unqualified());
        assert_eq!(r.repository(), "my.app");
    }

    #[test]
    fn test_registry_with_port() {
        let r: ContainerRef = "localhost:5000/ns/x:tag".parse().unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.namespace(), Some("ns"));
        assert_eq!(r.repository(), "x");
        assert_eq!(r.tag(), Some("tag"));
    }

    #[test]
    fn test_empty_fails() {
        assert_eq!("".parse::<ContainerRef>(), Err(Error::Empty));
    }

    #[test]
    fn test_reference_round_trip() {
        // I1: parse(format(r)) == r for canonical references.
        let r: ContainerRef = "registry.example.com/ns/repo:v1".parse().unwrap();
        let reparsed: ContainerRef = r.to_string().parse().unwrap();
        assert_eq!(r, reparsed);
    }

    #[test]
    fn test_manifests_path() {
        let r: ContainerRef = "registry.example.com/ns/repo:v1".parse().unwrap();
        assert_eq!(
            r.manifests_path().unwrap(),
            "/v2/ns/repo/manifests/v1"
        );
    }

    #[test]
    fn test_blobs_path_requires_digest() {
        let r: ContainerRef = "registry.example.com/ns/repo:v1".parse().unwrap();
        assert!(r.blobs_path().is_err());
        let d: Digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            .parse()
            .unwrap();
        let r = r.with_digest(d);
        assert!(r.blobs_path().unwrap().contains("/blobs/sha256:"));
    }

    #[test]
    fn test_platform_matches_strict_vs_loose() {
        let mut a = Platform::new("linux", "amd64");
        let mut b = a.clone();
        a.os_version = Some("1".into());
        b.os_version = Some("2".into());
        assert!(a.matches(&b, false));
        assert!(!a.matches(&b, true));
        assert!(a.matches(&a.clone(), true));
    }

    #[test]
    fn test_platform_unknown_is_distinct() {
        let unknown = Platform::new("unknown", "unknown");
        let real = Platform::new("linux", "amd64");
        assert!(!unknown.matches(&real, false));
    }
}
