//! Credential store (C4): Docker-style `config.json`, looked up by host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("username may not contain ':'")]
    UsernameContainsColon,
}

/// Fields are private so `Credential::new` is the only way to produce
/// one; otherwise a struct literal could smuggle in a username
/// containing ':' and break the Basic-auth encoding it's checked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, Error> {
        let username = username.into();
        if username.contains(':') {
            return Err(Error::UsernameContainsColon);
        }
        Ok(Credential {
            username,
            password: password.into(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    fn encode(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password))
    }

    fn decode(encoded: &str) -> Option<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let s = String::from_utf8(decoded).ok()?;
        let (user, pass) = s.split_once(':')?;
        Some(Credential {
            username: user.to_string(),
            password: pass.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct AuthEntry {
    auth: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

/// Loaded once per `Registry`, read-only after.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    auths: BTreeMap<String, Credential>,
    source: Option<PathBuf>,
}

impl CredentialStore {
    pub fn empty() -> Self {
        CredentialStore::default()
    }

    pub fn from_json_str(s: &str) -> Result<Self, Error> {
        let config: DockerConfig = serde_json::from_str(s)?;
        let auths = config
            .auths
            .into_iter()
            .filter_map(|(host, entry)| Credential::decode(&entry.auth).map(|c| (host, c)))
            .collect();
        Ok(CredentialStore { auths, source: None })
    }

    /// Tries, in order: `$DOCKER_CONFIG/config.json`, then
    /// `$HOME/.docker/config.json`, then
    /// `$HOME/.config/containers/auth.json`. First hit wins per-host
    /// (the first file found that parses is used wholesale, matching
    /// Docker's own resolution order).
    pub fn load_default(home: Option<&str>, docker_config: Option<&str>) -> Result<Self, Error> {
        let candidates = candidate_paths(home, docker_config);
        for path in candidates {
            match std::fs::read_to_string(&path) {
                Ok(s) => {
                    let mut store = Self::from_json_str(&s)?;
                    store.source = Some(path);
                    return Ok(store);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(CredentialStore::empty())
    }

    /// Returns `None` when no credential is present for `host` — not an
    /// error; downstream auth may proceed anonymously.
    pub fn get(&self, host: &str) -> Option<&Credential> {
        self.auths.get(host)
    }

    /// `credential` is always valid here: `Credential`'s fields are
    /// private, so the colon check in `Credential::new` cannot be
    /// bypassed by constructing one directly.
    pub fn put(&mut self, host: impl Into<String>, credential: Credential) {
        self.auths.insert(host.into(), credential);
    }

    pub fn basic_auth_header(&self, host: &str) -> Option<String> {
        self.auths.get(host).map(|c| format!("Basic {}", c.encode()))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        let config = DockerConfig {
            auths: self
                .auths
                .iter()
                .map(|(host, c)| (host.clone(), AuthEntry { auth: c.encode() }))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&config)?)
    }
}

fn candidate_paths(home: Option<&str>, docker_config: Option<&str>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dc) = docker_config {
        candidates.push(Path::new(dc).join("config.json"));
    }
    if let Some(home) = home {
        candidates.push(Path::new(home).join(".docker/config.json"));
        candidates.push(Path::new(home).join(".config/containers/auth.json"));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_basic_auth() {
        let cred = Credential::new("alice", "hunter2").unwrap();
        let mut store = CredentialStore::empty();
        store.put("registry.example.com", cred.clone());
        let header = store.basic_auth_header("registry.example.com").unwrap();
        assert_eq!(
            header,
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode("alice:hunter2")
            )
        );
    }

    #[test]
    fn test_username_with_colon_rejected() {
        assert!(matches!(
            Credential::new("a:b", "pw"),
            Err(Error::UsernameContainsColon)
        ));
    }

    #[test]
    fn test_missing_host_returns_none() {
        let store = CredentialStore::empty();
        assert!(store.get("nope.example.com").is_none());
    }

    #[test]
    fn test_parse_docker_config_json() {
        let cred = Credential::new("alice", "hunter2").unwrap();
        let json = format!(
            r#"{{"auths":{{"registry.example.com":{{"auth":"{}"}}}}}}"#,
            cred.encode()
        );
        let store = CredentialStore::from_json_str(&json).unwrap();
        assert_eq!(
            store.get("registry.example.com"),
            Some(&Credential::new("alice", "hunter2").unwrap())
        );
    }

    #[test]
    fn test_candidate_path_order() {
        let paths = candidate_paths(Some("/home/u"), Some("/custom"));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/custom/config.json"),
                PathBuf::from("/home/u/.docker/config.json"),
                PathBuf::from("/home/u/.config/containers/auth.json"),
            ]
        );
    }
}
