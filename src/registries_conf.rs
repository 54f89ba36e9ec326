//! Registries-conf resolver (C3): reads `registries.conf` and applies
//! unqualified-search, alias, rewrite, insecure/blocked policy to a
//! [`ContainerRef`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::reference::ContainerRef;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("short-name-mode {mode} forbids multiple unqualified-search-registries")]
    MultipleUnqualifiedForbidden { mode: String },
    #[error("registry {0} is blocked")]
    Blocked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortNameMode {
    Enforcing,
    Permissive,
    Disabled,
}

impl Default for ShortNameMode {
    fn default() -> Self {
        ShortNameMode::Enforcing
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(rename = "unqualified-search-registries", default)]
    unqualified_search_registries: Vec<String>,
    #[serde(rename = "short-name-mode", default)]
    short_name_mode: Option<ShortNameMode>,
    #[serde(rename = "registry", default)]
    registry: Vec<RawRegistry>,
    #[serde(default)]
    aliases: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawRegistry {
    prefix: Option<String>,
    location: Option<String>,
    #[serde(default)]
    insecure: bool,
    #[serde(default)]
    blocked: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryRewrite {
    pub prefix: String,
    pub location: String,
    pub insecure: bool,
    pub blocked: bool,
}

/// Loaded once per `Registry` construction and frozen; read-only after.
#[derive(Debug, Clone, Default)]
pub struct RegistriesConf {
    unqualified_search_registries: Vec<String>,
    short_name_mode: ShortNameMode,
    rewrites: Vec<RegistryRewrite>,
    aliases: BTreeMap<String, String>,
}

impl RegistriesConf {
    pub fn empty() -> Self {
        RegistriesConf::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let raw: RawConfig = toml::from_str(s)?;
        Self::from_raw(raw)
    }

    /// `$HOME/.config/containers/registries.conf`, or an empty (no-op)
    /// configuration if absent.
    pub fn load_default(home: Option<&str>) -> Result<Self, Error> {
        let Some(home) = home else {
            return Ok(RegistriesConf::empty());
        };
        let path = Path::new(home).join(".config/containers/registries.conf");
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistriesConf::empty()),
            Err(e) => Err(e.into()),
        }
    }

    fn from_raw(raw: RawConfig) -> Result<Self, Error> {
        let short_name_mode = raw.short_name_mode.unwrap_or_default();
        if matches!(
            short_name_mode,
            ShortNameMode::Enforcing | ShortNameMode::Permissive
        ) && raw.unqualified_search_registries.len() > 1
        {
            return Err(Error::MultipleUnqualifiedForbidden {
                mode: format!("{:?}", short_name_mode).to_lowercase(),
            });
        }
        // longest-prefix-first so the first rewrite match wins.
        let mut rewrites: Vec<RegistryRewrite> = raw
            .registry
            .into_iter()
            .filter_map(|r| {
                let prefix = r.prefix.or_else(|| r.location.clone())?;
                let location = r.location.unwrap_or_else(|| prefix.clone());
                Some(RegistryRewrite {
                    prefix,
                    location,
                    insecure: r.insecure,
                    blocked: r.blocked,
                })
            })
            .collect();
        rewrites.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(RegistriesConf {
            unqualified_search_registries: raw.unqualified_search_registries,
            short_name_mode,
            rewrites,
            aliases: raw.aliases.unwrap_or_default(),
        })
    }

    pub fn unqualified_search_registries(&self) -> &[String] {
        &self.unqualified_search_registries
    }

    fn find_rewrite(&self, canonical: &str) -> Option<&RegistryRewrite> {
        self.rewrites
            .iter()
            .find(|r| canonical.starts_with(r.prefix.as_str()))
    }

    pub fn is_insecure(&self, canonical: &str) -> bool {
        self.find_rewrite(canonical).map(|r| r.insecure).unwrap_or(false)
    }

    /// Resolves a reference: (a) alias substitution, (b) unqualified
    /// search-registry policy, (c) longest-prefix rewrite. Alias
    /// resolution is applied before prefix rewrites.
    pub fn resolve(&self, reference: &ContainerRef) -> Result<Vec<ContainerRef>, Error> {
        if let Some(aliased) = self.aliases.get(reference.repository()) {
            let r: ContainerRef = aliased
                .parse()
                .map_err(|_| Error::Blocked(aliased.clone()))?;
            self.check_blocked(&r)?;
            return Ok(vec![r]);
        }

        if reference.is_unqualified() {
            let candidates: Vec<ContainerRef> = self
                .unqualified_search_registries
                .iter()
                .map(|reg| reference.with_registry(reg.clone()))
                .collect();
            let candidates = if candidates.is_empty() {
                vec![reference.clone()]
            } else {
                candidates
            };
            for c in &candidates {
                self.check_blocked(&self.apply_rewrite(c))?;
            }
            return Ok(candidates.iter().map(|c| self.apply_rewrite(c)).collect());
        }

        let rewritten = self.apply_rewrite(reference);
        self.check_blocked(&rewritten)?;
        Ok(vec![rewritten])
    }

    fn apply_rewrite(&self, reference: &ContainerRef) -> ContainerRef {
        let canonical = format!("{}/{}", reference.registry(), reference.name());
        match self.find_rewrite(&canonical) {
            Some(rewrite) => {
                let replaced = canonical.replacen(&rewrite.prefix, &rewrite.location, 1);
                match replaced.split_once('/') {
                    Some((registry, _)) => reference.with_registry(registry),
                    None => reference.with_registry(replaced),
                }
            }
            None => reference.clone(),
        }
    }

    fn check_blocked(&self, reference: &ContainerRef) -> Result<(), Error> {
        let canonical = format!("{}/{}", reference.registry(), reference.name());
        if let Some(rewrite) = self.find_rewrite(&canonical) {
            if rewrite.blocked {
                return Err(Error::Blocked(canonical));
            }
        }
        Ok(())
    }
}

pub fn default_path(home: &str) -> PathBuf {
    Path::new(home).join(".config/containers/registries.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unqualified_search() {
        let conf = RegistriesConf::from_toml_str(
            r#"unqualified-search-registries = ["docker.io", "quay.io"]"#,
        )
        .unwrap();
        let r: ContainerRef = "alpine".parse().unwrap();
        let resolved = conf.resolve(&r).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].registry(), "docker.io");
        assert_eq!(resolved[1].registry(), "quay.io");
    }

    #[test]
    fn test_enforcing_rejects_multiple_unqualified() {
        let err = RegistriesConf::from_toml_str(
            r#"
            unqualified-search-registries = ["docker.io", "quay.io"]
            short-name-mode = "enforcing"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MultipleUnqualifiedForbidden { .. }));
    }

    #[test]
    fn test_prefix_rewrite_longest_wins() {
        let conf = RegistriesConf::from_toml_str(
            r#"
            [[registry]]
            prefix = "docker.io"
            location = "mirror.example.com"

            [[registry]]
            prefix = "docker.io/library"
            location = "mirror2.example.com/lib"
            "#,
        )
        .unwrap();
        let r: ContainerRef = "docker.io/library/alpine:latest".parse().unwrap();
        let resolved = conf.resolve(&r).unwrap();
        assert_eq!(resolved[0].registry(), "mirror2.example.com");
    }

    #[test]
    fn test_blocked_registry_rejected() {
        let conf = RegistriesConf::from_toml_str(
            r#"
            [[registry]]
            prefix = "evil.example.com"
            location = "evil.example.com"
            blocked = true
            "#,
        )
        .unwrap();
        let r: ContainerRef = "evil.example.com/x:latest".parse().unwrap();
        assert!(conf.resolve(&r).is_err());
    }

    #[test]
    fn test_alias_applied_before_rewrite() {
        let conf = RegistriesConf::from_toml_str(
            r#"
            [aliases]
            myalias = "registry.example.com/real/path:latest"

            [[registry]]
            prefix = "registry.example.com"
            location = "mirror.example.com"
            "#,
        )
        .unwrap();
        let r: ContainerRef = "myalias".parse().unwrap();
        let resolved = conf.resolve(&r).unwrap();
        // alias wins outright; the prefix rewrite never applies to it.
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].registry(), "registry.example.com");
    }

    #[test]
    fn test_insecure_flag() {
        let conf = RegistriesConf::from_toml_str(
            r#"
            [[registry]]
            prefix = "localhost:5000"
            location = "localhost:5000"
            insecure = true
            "#,
        )
        .unwrap();
        assert!(conf.is_insecure("localhost:5000/ns/repo"));
        assert!(!conf.is_insecure("example.com/ns/repo"));
    }
}
