//! Scope algebra (C5): canonicalize and merge `resource:name:actions`
//! tokens presented to the token service.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed scope: {0}")]
    BadFormat(String),
}

/// A single normalized `resource:name:action[,action...]` scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Scope {
    resource: String,
    name: String,
    actions: Vec<String>,
}

impl Scope {
    pub fn new(resource: impl Into<String>, name: impl Into<String>, actions: Vec<String>) -> Self {
        let mut s = Scope {
            resource: resource.into(),
            name: name.into(),
            actions,
        };
        s.normalize_actions();
        s
    }

    pub fn repository(name: impl Into<String>, actions: Vec<String>) -> Self {
        Scope::new("repository", name, actions)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    fn key(&self) -> (&str, &str) {
        (&self.resource, &self.name)
    }

    fn normalize_actions(&mut self) {
        self.actions.retain(|a| !a.is_empty());
        if self.actions.iter().any(|a| a == "*") {
            self.actions = vec!["*".to_string()];
            return;
        }
        self.actions.sort();
        self.actions.dedup();
    }

    fn merge_actions(&mut self, other: &[String]) {
        self.actions.extend(other.iter().cloned());
        self.normalize_actions();
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource,
            self.name,
            self.actions.join(",")
        )
    }
}

impl std::str::FromStr for Scope {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let resource = parts.next().ok_or_else(|| Error::BadFormat(s.to_string()))?;
        let name = parts.next().ok_or_else(|| Error::BadFormat(s.to_string()))?;
        let actions = parts.next().ok_or_else(|| Error::BadFormat(s.to_string()))?;
        if resource.is_empty() || name.is_empty() {
            return Err(Error::BadFormat(s.to_string()));
        }
        Ok(Scope::new(
            resource,
            name,
            actions.split(',').map(str::to_string).collect(),
        ))
    }
}

/// Sorts scopes lexicographically, dedupes/sorts actions within each,
/// collapses `*` action lists, and merges scopes sharing resource+name.
/// Idempotent: `clean(clean(xs)) == clean(xs)`.
pub fn clean_scopes(scopes: impl IntoIterator<Item = Scope>) -> Vec<Scope> {
    let mut merged: BTreeMap<(String, String), Scope> = BTreeMap::new();
    for scope in scopes {
        let key = (scope.resource.clone(), scope.name.clone());
        merged
            .entry(key)
            .and_modify(|existing| existing.merge_actions(&scope.actions))
            .or_insert(scope);
    }
    merged.into_values().collect()
}

/// Parses a `scope=` query value (space-separated scope tokens) and
/// returns the cleaned set.
pub fn parse_scope_string(s: &str) -> Result<Vec<Scope>, Error> {
    clean_scopes_result(s.split_whitespace().map(str::parse))
}

fn clean_scopes_result(
    scopes: impl Iterator<Item = Result<Scope, Error>>,
) -> Result<Vec<Scope>, Error> {
    let scopes: Result<Vec<Scope>, Error> = scopes.collect();
    Ok(clean_scopes(scopes?))
}

/// Formats a set of (already cleaned) scopes for the `scope=` query
/// parameter: scopes space-separated, actions within a scope
/// comma-separated, in normalized order.
pub fn format_scope_string(scopes: &[Scope]) -> String {
    let mut scopes = scopes.to_vec();
    scopes.sort();
    scopes
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Adds or merges a `repository:<namespace/repo>:<actions>` entry into
/// an existing scope set.
pub fn append_repository_scope(
    scopes: Vec<Scope>,
    repository: impl Into<String>,
    actions: Vec<String>,
) -> Vec<Scope> {
    let mut scopes = scopes;
    scopes.push(Scope::repository(repository, actions));
    clean_scopes(scopes)
}

/// Unions two already-cleaned scope sets, e.g. when a 403 challenge
/// requests wider scopes than the token originally cached.
pub fn union_scopes(a: Vec<Scope>, b: Vec<Scope>) -> Vec<Scope> {
    clean_scopes(a.into_iter().chain(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_push(repo: &str) -> Scope {
        Scope::repository(repo, vec!["pull".into(), "push".into()])
    }

    #[test]
    fn test_normalize_sorts_and_dedupes_actions() {
        let s = Scope::repository("lib/x", vec!["push".into(), "pull".into(), "pull".into()]);
        assert_eq!(s.actions(), &["pull".to_string(), "push".to_string()]);
    }

    #[test]
    fn test_wildcard_collapses_actions() {
        let s = Scope::repository("lib/x", vec!["pull".into(), "*".into()]);
        assert_eq!(s.actions(), &["*".to_string()]);
    }

    #[test]
    fn test_clean_is_idempotent() {
        let xs = vec![pull_push("a/b"), Scope::repository("a/b", vec!["pull".into()])];
        let once = clean_scopes(xs);
        let twice = clean_scopes(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_same_resource_and_name() {
        let xs = vec![
            Scope::repository("a/b", vec!["pull".into()]),
            Scope::repository("a/b", vec!["push".into()]),
        ];
        let merged = clean_scopes(xs);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].actions(), &["pull".to_string(), "push".to_string()]);
    }

    #[test]
    fn test_parse_and_format_roundtrip() {
        let s: Scope = "repository:lib/x:pull,push".parse().unwrap();
        assert_eq!(s.to_string(), "repository:lib/x:pull,push");
    }

    #[test]
    fn test_union_accumulates_scopes() {
        let old = vec![Scope::repository("a", vec!["pull".into()])];
        let new = vec![Scope::repository("a", vec!["push".into()])];
        let union = union_scopes(old, new);
        assert_eq!(union.len(), 1);
        assert_eq!(union[0].actions(), &["pull".to_string(), "push".to_string()]);
    }
}
