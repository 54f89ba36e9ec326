//! Root error type shared across the distribution client, auth engine,
//! OCI Image Layout, and copy engine. Leaf modules (digest, scope,
//! reference) keep their own small error enums and funnel into this one
//! with `#[from]`.

use reqwest::StatusCode;

use crate::{credentials, digest, reference, registries_conf, scope};

/// A server-reported error entry from the OCI error envelope
/// `{"errors":[{"code":...,"message":...,"detail":...}]}`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerErrorEnvelope {
    #[serde(default)]
    pub errors: Vec<ServerError>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    ParseReference(#[from] reference::Error),

    #[error(transparent)]
    ParseDigest(#[from] digest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    RegistriesConf(#[from] registries_conf::Error),

    #[error(transparent)]
    Scope(#[from] scope::Error),

    #[error(transparent)]
    Credentials(#[from] credentials::Error),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("registry returned {status}{}", server_errors_suffix(errors))]
    Http {
        status: StatusCode,
        errors: Vec<ServerError>,
    },

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("oci-spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

fn server_errors_suffix(errors: &[ServerError]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        let joined = errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        format!(" ({joined})")
    }
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Builds an `Error::Http` from a non-2xx response, parsing the OCI
    /// error envelope out of the body when present.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let errors = match response.bytes().await {
            Ok(body) => serde_json::from_slice::<ServerErrorEnvelope>(&body)
                .map(|e| e.errors)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Error::Http { status, errors }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
