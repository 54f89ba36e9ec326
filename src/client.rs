//! Distribution protocol client (C8): `Registry`, a `ContentStore`
//! backed by the OCI Distribution HTTP API.

use bytes::Bytes;
use log::{trace, warn};
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, MediaType, SCHEMA_VERSION};
use reqwest::{header, StatusCode};

use crate::auth::AuthProvider;
use crate::content_store::{ContentStore, Referrers, Selector};
use crate::digest::{self, Digest};
use crate::error::{Error, Result};
use crate::reference::ContainerRef;
use crate::registries_conf::RegistriesConf;
use crate::scope::Scope;
use crate::transport::{Transport, TransportConfig};

const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.list.v2+json";

/// One repository's worth of registry access: a fixed host, name, auth
/// provider, and transport. Constructed per-repository because the
/// token scope is `repository:<name>:...`.
pub struct Registry {
    transport: Transport,
    auth: AuthProvider,
    host: String,
    name: String,
    insecure: bool,
}

impl Registry {
    /// Resolves `reference` against `conf`, builds a transport, and
    /// probes `/v2/` to fail fast on non-OCI-conformant hosts (the
    /// `Docker-Distribution-API-Version` check).
    pub async fn connect(
        reference: &ContainerRef,
        conf: &RegistriesConf,
        auth: AuthProvider,
    ) -> Result<Self> {
        let resolved = conf.resolve(reference)?;
        let chosen = resolved
            .into_iter()
            .next()
            .ok_or_else(|| Error::invariant("no candidate registry resolved"))?;
        let insecure = conf.is_insecure(&format!("{}/{}", chosen.registry(), chosen.name()));
        let transport = Transport::new(TransportConfig {
            insecure_skip_verify: insecure,
            plain_http: insecure,
        })?;
        let registry = Registry {
            transport,
            auth,
            host: chosen.api_registry().to_string(),
            name: chosen.name(),
            insecure,
        };
        registry.check_api_version().await?;
        Ok(registry)
    }

    pub fn for_host(host: impl Into<String>, name: impl Into<String>, auth: AuthProvider, insecure: bool) -> Result<Self> {
        let transport = Transport::new(TransportConfig {
            insecure_skip_verify: insecure,
            plain_http: insecure,
        })?;
        Ok(Registry {
            transport,
            auth,
            host: host.into(),
            name: name.into(),
            insecure,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, path: &str) -> String {
        self.transport.url(&self.host, path)
    }

    async fn check_api_version(&self) -> Result<()> {
        let req = self.transport.get(&self.url("/v2/"));
        let response = self.authed_send(req, None).await?;
        match response.headers().get("docker-distribution-api-version") {
            Some(v) => {
                trace!("registry {} api version {:?}", self.host, v);
                Ok(())
            }
            None if response.status().is_success() || response.status() == StatusCode::UNAUTHORIZED => Ok(()),
            None => Err(Error::invariant(format!(
                "{} does not look like an OCI distribution endpoint",
                self.host
            ))),
        }
    }

    /// Sends `req`, applying whatever credential the auth provider has
    /// up front; on 401/403 parses the challenge, fetches a token
    /// scoped at least to `repository:<name>:pull`, and retries once.
    async fn authed_send(
        &self,
        req: reqwest::RequestBuilder,
        extra_scope: Option<Scope>,
    ) -> Result<reqwest::Response> {
        let (client, request) = req.build_split();
        let request = request.map_err(Error::from)?;
        let body_bytes = request.body().and_then(|b| b.as_bytes()).map(Bytes::copy_from_slice);

        let rebuild = |builder: reqwest::RequestBuilder| -> reqwest::RequestBuilder {
            let builder = copy_headers(builder, request.headers());
            match &body_bytes {
                Some(b) => builder.body(b.clone()),
                None => builder,
            }
        };

        let applied = self
            .auth
            .apply(&self.host, client.request(request.method().clone(), request.url().clone()))
            .await;
        let first = rebuild(applied).send().await?;

        if first.status() != StatusCode::UNAUTHORIZED && first.status() != StatusCode::FORBIDDEN {
            return Ok(first);
        }

        let Some(challenge) = first.headers().get(header::WWW_AUTHENTICATE).cloned() else {
            return Ok(first);
        };

        let scope = extra_scope.unwrap_or_else(|| {
            Scope::repository(self.name.clone(), vec!["pull".to_string()])
        });

        match self
            .auth
            .authenticate(self.transport.inner(), &self.host, &challenge, Some(scope))
            .await?
        {
            Some(token) => {
                let retry = self
                    .transport
                    .inner()
                    .request(request.method().clone(), request.url().clone());
                let retry = rebuild(retry).bearer_auth(token);
                Ok(retry.send().await?)
            }
            None => Ok(first),
        }
    }

    fn blob_url(&self, digest: &Digest) -> String {
        self.url(&format!("/v2/{}/blobs/{}", self.name, digest))
    }

    fn manifest_url(&self, selector: &Selector) -> Result<String> {
        let id = selector
            .digest
            .as_ref()
            .map(|d| d.to_string())
            .or_else(|| selector.tag.clone())
            .ok_or_else(|| Error::invariant("selector has neither tag nor digest"))?;
        Ok(self.url(&format!("/v2/{}/manifests/{}", self.name, id)))
    }

    pub async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = self.url(&format!("/v2/{}/tags/list", self.name));
        loop {
            #[derive(serde::Deserialize)]
            struct TagsList {
                tags: Vec<String>,
            }
            let response = self.authed_send(self.transport.get(&url), None).await?;
            if response.status() != StatusCode::OK {
                return Err(Error::from_response(response).await);
            }
            let next = next_link(&response);
            let body: TagsList = response.json().await?;
            tags.extend(body.tags);
            match next {
                Some(n) => url = n,
                None => break,
            }
        }
        Ok(tags)
    }

    pub async fn push_blob_monolithic(&self, digest: &Digest, data: Bytes) -> Result<()> {
        if self.exists(digest).await? {
            return Ok(());
        }
        let start_url = self.url(&format!("/v2/{}/blobs/uploads/", self.name));
        let session = self
            .authed_send(
                self.transport.post(&start_url),
                Some(Scope::repository(self.name.clone(), vec!["push".to_string(), "pull".to_string()])),
            )
            .await?;
        if session.status() != StatusCode::ACCEPTED {
            return Err(Error::from_response(session).await);
        }
        let location = session
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::invariant("upload session response missing Location"))?
            .to_string();
        let upload_url = resolve_location(&start_url, &location)?;
        let put_url = format!(
            "{}{}digest={}",
            upload_url,
            if upload_url.contains('?') { "&" } else { "?" },
            digest
        );
        let response = self
            .authed_send(
                self.transport
                    .put(&put_url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(data),
                Some(Scope::repository(self.name.clone(), vec!["push".to_string(), "pull".to_string()])),
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::from_response(response).await);
        }
        Ok(())
    }

    /// Mounts a blob from another repository on the same registry host,
    /// skipping a download+upload round trip (§4.8 `crossRepoMount`).
    pub async fn mount_blob(&self, digest: &Digest, from_repository: &str) -> Result<bool> {
        let url = format!(
            "{}?mount={}&from={}",
            self.url(&format!("/v2/{}/blobs/uploads/", self.name)),
            digest,
            from_repository
        );
        let response = self.authed_send(self.transport.post(&url), None).await?;
        Ok(response.status() == StatusCode::CREATED)
    }

    /// §4.8 `pushBlobChunked`: same POST-session start as the
    /// monolithic path, then one `PATCH` per chunk, each one obeying
    /// the `OCI-Chunk-Min-Length` the session advertised, finished by
    /// a zero-length `PUT ?digest=` to close the session.
    pub async fn push_blob_chunked(&self, digest: &Digest, data: Bytes, chunk_size: usize) -> Result<()> {
        if self.exists(digest).await? {
            return Ok(());
        }
        let push_pull = || Scope::repository(self.name.clone(), vec!["push".to_string(), "pull".to_string()]);
        let start_url = self.url(&format!("/v2/{}/blobs/uploads/", self.name));
        let session = self.authed_send(self.transport.post(&start_url), Some(push_pull())).await?;
        if session.status() != StatusCode::ACCEPTED {
            return Err(Error::from_response(session).await);
        }
        let location = session
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::invariant("upload session response missing Location"))?
            .to_string();
        let min_length = Transport::chunk_min_length(&session).max(1) as usize;
        let chunk_size = chunk_size.max(min_length);

        let mut location = resolve_location(&start_url, &location)?;
        let mut offset: u64 = 0;
        for chunk in data.chunks(chunk_size) {
            let response = self.transport.patch_chunk(&location, offset, Bytes::copy_from_slice(chunk)).await?;
            if response.status() != StatusCode::ACCEPTED {
                return Err(Error::from_response(response).await);
            }
            offset += chunk.len() as u64;
            let next = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::invariant("chunk upload response missing Location"))?
                .to_string();
            location = resolve_location(&location, &next)?;
        }

        let put_url = format!(
            "{}{}digest={}",
            location,
            if location.contains('?') { "&" } else { "?" },
            digest
        );
        let response = self
            .authed_send(
                self.transport.put(&put_url).header(header::CONTENT_LENGTH, "0"),
                Some(push_pull()),
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::from_response(response).await);
        }
        Ok(())
    }

    /// §4.8 `deleteBlob`.
    pub async fn delete_blob(&self, digest: &Digest) -> Result<()> {
        let response = self.authed_send(self.transport.delete(&self.blob_url(digest)), None).await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(Error::from_response(response).await),
        }
    }

    /// §4.8 `deleteManifest`.
    pub async fn delete_manifest(&self, selector: &Selector) -> Result<()> {
        let url = self.manifest_url(selector)?;
        let response = self.authed_send(self.transport.delete(&url), None).await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(Error::from_response(response).await),
        }
    }

    /// §4.8 `listRepos`: `/v2/_catalog`, paginated the same way as
    /// `list_tags`.
    pub async fn list_repos(&self) -> Result<Vec<String>> {
        let mut repos = Vec::new();
        let mut url = self.url("/v2/_catalog");
        loop {
            #[derive(serde::Deserialize)]
            struct Catalog {
                repositories: Vec<String>,
            }
            let response = self.authed_send(self.transport.get(&url), None).await?;
            if response.status() != StatusCode::OK {
                return Err(Error::from_response(response).await);
            }
            let next = next_link(&response);
            let body: Catalog = response.json().await?;
            repos.extend(body.repositories);
            match next {
                Some(n) => url = n,
                None => break,
            }
        }
        Ok(repos)
    }
}

impl ContentStore for Registry {
    async fn push_blob(&self, digest: &Digest, data: Bytes) -> Result<()> {
        self.push_blob_monolithic(digest, data).await
    }

    async fn fetch_blob(&self, digest: &Digest) -> Result<Option<Bytes>> {
        let response = self.authed_send(self.transport.get(&self.blob_url(digest)), None).await?;
        match response.status() {
            StatusCode::OK => {
                let data = response.bytes().await?;
                let computed = digest::digest_with(digest.algorithm(), &data);
                if &computed != digest {
                    return Err(Error::DigestMismatch {
                        expected: digest.to_string(),
                        computed: computed.to_string(),
                    });
                }
                Ok(Some(data))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Error::from_response(response).await),
        }
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let response = self.authed_send(self.transport.head(&self.blob_url(digest)), None).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(Error::Http {
                status: other,
                errors: Vec::new(),
            }),
        }
    }

    async fn push_manifest(
        &self,
        selector: &Selector,
        media_type: &str,
        data: Bytes,
    ) -> Result<Descriptor> {
        let url = self.manifest_url(selector)?;
        let computed = digest::digest(&data);
        let response = self
            .authed_send(
                self.transport
                    .put(&url)
                    .header(header::CONTENT_TYPE, media_type.to_string())
                    .body(data.clone()),
                Some(Scope::repository(self.name.clone(), vec!["push".to_string(), "pull".to_string()])),
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::from_response(response).await);
        }
        let oci_digest: oci_spec::image::Digest = (&computed).try_into()?;
        Ok(DescriptorBuilder::default()
            .media_type(media_type)
            .size(data.len() as u64)
            .digest(oci_digest)
            .build()
            .map_err(|e| Error::invariant(e.to_string()))?)
    }

    async fn get_manifest(&self, selector: &Selector) -> Result<Option<(Descriptor, Bytes)>> {
        let url = self.manifest_url(selector)?;
        let response = self
            .authed_send(self.transport.get(&url).header(header::ACCEPT, ACCEPT_MANIFEST), None)
            .await?;
        match response.status() {
            StatusCode::OK => {
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let header_digest = response
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Digest>().ok());
                let data = response.bytes().await?;
                let computed = digest::digest(&data);
                let expected = header_digest.or_else(|| selector.digest.clone());
                if let Some(expected) = &expected {
                    if expected != &computed {
                        return Err(Error::DigestMismatch {
                            expected: expected.to_string(),
                            computed: computed.to_string(),
                        });
                    }
                }
                let oci_digest: oci_spec::image::Digest = (&computed).try_into()?;
                let descriptor = DescriptorBuilder::default()
                    .media_type(content_type.as_str())
                    .size(data.len() as u64)
                    .digest(oci_digest)
                    .build()
                    .map_err(|e| Error::invariant(e.to_string()))?;
                Ok(Some((descriptor, data)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Error::from_response(response).await),
        }
    }

    async fn probe_descriptor(&self, selector: &Selector) -> Result<Option<Descriptor>> {
        let url = self.manifest_url(selector)?;
        let response = self
            .authed_send(self.transport.head(&url).header(header::ACCEPT, ACCEPT_MANIFEST), None)
            .await?;
        match response.status() {
            StatusCode::OK => {
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let size = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                let digest = response
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Digest>().ok())
                    .or_else(|| selector.digest.clone())
                    .ok_or_else(|| Error::invariant("no digest for probed manifest"))?;
                let oci_digest: oci_spec::image::Digest = (&digest).try_into()?;
                Ok(Some(
                    DescriptorBuilder::default()
                        .media_type(content_type.as_str())
                        .size(size)
                        .digest(oci_digest)
                        .build()
                        .map_err(|e| Error::invariant(e.to_string()))?,
                ))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Error::from_response(response).await),
        }
    }

    async fn get_referrers(&self, subject: &Digest, artifact_type: Option<&str>) -> Result<Referrers> {
        let mut url = self.url(&format!("/v2/{}/referrers/{}", self.name, subject));
        if let Some(artifact_type) = artifact_type {
            url = format!("{url}?artifactType={artifact_type}");
        }
        let response = self.authed_send(self.transport.get(&url), None).await?;
        match response.status() {
            StatusCode::OK => {
                let filters_applied = response
                    .headers()
                    .get("oci-filters-applied")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                let data = response.bytes().await?;
                let index = ImageIndex::from_reader(std::io::Cursor::new(&data))?;
                Ok(Referrers { index, filters_applied })
            }
            StatusCode::NOT_FOUND => self.get_referrers_tag_fallback(subject, artifact_type).await,
            _ => Err(Error::from_response(response).await),
        }
    }
}

impl Registry {
    /// §4.8: form a tag `<alg>-<hex>` and fetch it as a manifest; if it
    /// is an index, return it, else return an empty index. The tag
    /// schema predates the `OCI-Filters-Applied` header, so any
    /// `artifact_type` filter is always applied client-side here.
    async fn get_referrers_tag_fallback(&self, subject: &Digest, artifact_type: Option<&str>) -> Result<Referrers> {
        warn!("referrers API unsupported on {}, falling back to tag schema", self.host);
        let selector = Selector::from_tag(subject.as_tag());
        let manifests = match self.get_manifest(&selector).await? {
            Some((descriptor, data)) if descriptor.media_type() == &MediaType::ImageIndex => {
                ImageIndex::from_reader(std::io::Cursor::new(&data))?.manifests().clone()
            }
            _ => Vec::new(),
        };
        let (manifests, filters_applied) = apply_artifact_type_filter(manifests, artifact_type);
        Ok(Referrers {
            index: ImageIndexBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .media_type(MediaType::ImageIndex)
                .manifests(manifests)
                .build()
                .map_err(|e| Error::invariant(e.to_string()))?,
            filters_applied,
        })
    }
}

/// Filters `manifests` to those whose `artifactType` matches `wanted`,
/// when `wanted` is given; returns the (possibly unfiltered) list
/// alongside the `OCI-Filters-Applied` value a server would report for
/// having done so itself.
pub(crate) fn apply_artifact_type_filter(
    manifests: Vec<Descriptor>,
    wanted: Option<&str>,
) -> (Vec<Descriptor>, Option<String>) {
    match wanted {
        None => (manifests, None),
        Some(wanted) => {
            let filtered = manifests
                .into_iter()
                .filter(|m| m.artifact_type().as_ref().map(|t| t.to_string().as_str() == wanted).unwrap_or(false))
                .collect();
            (filtered, Some(wanted.to_string()))
        }
    }
}

fn copy_headers(mut builder: reqwest::RequestBuilder, headers: &header::HeaderMap) -> reqwest::RequestBuilder {
    for (name, value) in headers.iter() {
        if name == header::AUTHORIZATION {
            continue;
        }
        builder = builder.header(name, value.clone());
    }
    builder
}

fn resolve_location(request_url: &str, location: &str) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(location.to_string())
    } else {
        let base = request_url
            .parse::<reqwest::Url>()
            .map_err(|e| Error::Parse(e.to_string()))?;
        Transport::upload_location(&base, location).map(|u| u.to_string())
    }
}

fn next_link(response: &reqwest::Response) -> Option<String> {
    let link = response.headers().get(header::LINK)?.to_str().ok()?;
    let (url, rel) = link.split_once(';')?;
    if rel.contains("rel=\"next\"") {
        Some(url.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    } else {
        None
    }
}
