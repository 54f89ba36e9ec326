//! HTTP transport (C6): a thin `reqwest::Client` wrapper with the
//! redirect and streaming behavior registries expect, plus chunked
//! PATCH uploads.
//!
//! Registries sometimes redirect blob downloads to a different origin
//! (e.g. a CDN). `reqwest` itself drops `Authorization` (and other
//! sensitive headers) from the follow-up request whenever the redirect
//! target's host differs from the original one; a custom
//! `redirect::Policy` closure has no `Action` that could mutate the
//! follow-up request's headers, so this module does not and cannot
//! implement that stripping itself. What `redirect_policy` adds on top
//! is a tighter hop limit than `reqwest`'s default and a log line so a
//! cross-origin hop is visible in a trace.

use bytes::Bytes;
use log::trace;
use reqwest::{header, Method, Url};

use crate::error::Result;

/// Caps redirects at 5 (matching the teacher's client) and logs
/// cross-origin hops. Does not and cannot strip headers on the
/// follow-up request itself; see the module doc.
fn redirect_policy() -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(|attempt| {
        let is_cross_origin = attempt
            .previous()
            .last()
            .map(|prev| prev.origin() != attempt.url().origin())
            .unwrap_or(false);
        if attempt.previous().len() >= 5 {
            return attempt.error("too many redirects");
        }
        if is_cross_origin {
            trace!(
                "cross-origin redirect {} -> {}",
                attempt.previous().last().map(|u| u.as_str()).unwrap_or(""),
                attempt.url()
            );
        }
        attempt.follow()
    })
}

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    insecure: bool,
}

pub struct TransportConfig {
    pub insecure_skip_verify: bool,
    pub plain_http: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            insecure_skip_verify: false,
            plain_http: false,
        }
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(redirect_policy())
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()?;
        Ok(Transport {
            client,
            insecure: config.plain_http,
        })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    pub fn url(&self, host: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme(), host, path)
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.request(Method::GET, url)
    }

    pub fn head(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.request(Method::HEAD, url)
    }

    pub fn put(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.request(Method::PUT, url)
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.request(Method::POST, url)
    }

    pub fn patch(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.request(Method::DELETE, url)
    }

    /// Uploads `chunk` as one PATCH with `Content-Range: start-end`,
    /// returning the `Location` header for the next chunk (or final
    /// PUT) per the chunked-upload protocol.
    pub async fn patch_chunk(
        &self,
        location: &str,
        start: u64,
        chunk: Bytes,
    ) -> Result<reqwest::Response> {
        let end = start + chunk.len() as u64;
        let content_range = format!("{start}-{}", end.saturating_sub(1));
        let response = self
            .client
            .request(Method::PATCH, location)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_RANGE, content_range)
            .header(header::CONTENT_LENGTH, chunk.len().to_string())
            .body(chunk)
            .send()
            .await?;
        Ok(response)
    }

    /// Minimal chunk size a registry will accept, from the
    /// `OCI-Chunk-Min-Length` response header on the upload session
    /// (falls back to 1 when absent, i.e. no minimum).
    pub fn chunk_min_length(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get("oci-chunk-min-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    pub fn upload_location(base: &Url, location_header: &str) -> Result<Url> {
        base.join(location_header)
            .map_err(|e| crate::error::Error::Parse(e.to_string()))
    }
}
