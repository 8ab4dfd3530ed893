//! Merge Engine for master/minion Ingresses
//!
//! A composite site is one root fragment (the master) plus the leaf fragments
//! (minions) that share its host. The root contributes server-level settings,
//! leaves contribute paths.
//!
//! Leaves are always walked in creation order, oldest first, ties broken by
//! namespace/name. That order decides which leaf owns a path claimed twice
//! and the order of the generated locations.

use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

use super::cache::{CacheError, ResourceKey};
use super::fragment::{FragmentRole, ResolvedFragment, RouteFragment};
use super::resolver::ResolveError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Ingress Resource {key} is not a master")]
    NotARoot { key: ResourceKey },

    #[error("Ingress Resource {key} with the 'nginx.org/mergeable-ingress-type' annotation set to 'master' must contain exactly one rule without paths")]
    InvalidRoot { key: ResourceKey },

    #[error("Master {key} is invalid: {source}")]
    RootResolve { key: ResourceKey, source: ResolveError },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl MergeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MergeError::Cache(_))
            || matches!(self, MergeError::RootResolve { source, .. } if source.is_transient())
    }
}

/// A fragment-level problem found while merging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDiagnostic {
    pub key: ResourceKey,
    pub message: String,
}

impl MergeDiagnostic {
    pub(crate) fn new(key: &ResourceKey, message: impl Into<String>) -> Self {
        let diagnostic = Self {
            key: key.clone(),
            message: message.into(),
        };
        warn!(key = %diagnostic.key, "{}", diagnostic.message);
        diagnostic
    }
}

/// One root plus its merged leaves, leaves in creation order
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeSite {
    pub master: ResolvedFragment,
    pub minions: Vec<ResolvedFragment>,
    pub diagnostics: Vec<MergeDiagnostic>,
}

impl CompositeSite {
    pub fn key(&self) -> &ResourceKey {
        &self.master.fragment.key
    }

    pub fn host(&self) -> &str {
        self.master.fragment.host().unwrap_or_default()
    }

    pub fn minion_keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.minions.iter().map(|m| &m.fragment.key)
    }
}

/// A root must have exactly one rule and no paths. Returns the root with an
/// empty path set injected so resolution accepts it.
pub fn validate_root(mut root: RouteFragment) -> Result<RouteFragment, MergeError> {
    if root.role != FragmentRole::CompositeRoot {
        return Err(MergeError::NotARoot { key: root.key });
    }
    match root.rules.as_mut_slice() {
        [rule] if rule.paths.iter().all(Vec::is_empty) => {
            rule.paths = Some(Vec::new());
            Ok(root)
        }
        _ => Err(MergeError::InvalidRoot { key: root.key }),
    }
}

/// True if `leaf` is a leaf aimed at the site rooted at a fragment for `host`
fn is_leaf_for_host(leaf: &RouteFragment, host: &str) -> bool {
    leaf.role == FragmentRole::CompositeLeaf && leaf.host() == Some(host)
}

/// Why a leaf for the right host still cannot join: one rule with an http
/// section is required
fn leaf_shape_error(leaf: &RouteFragment) -> Option<String> {
    match leaf.rules.as_slice() {
        [rule] if rule.paths.is_some() => None,
        [_] => Some(format!(
            "Ingress Resource {} with the 'nginx.org/mergeable-ingress-type' annotation set to 'minion' must contain a Path. It will be ignored",
            leaf.key
        )),
        _ => Some(format!(
            "Ingress Resource {} with the 'nginx.org/mergeable-ingress-type' annotation set to 'minion' must contain only one host. It will be ignored",
            leaf.key
        )),
    }
}

/// Build the composite site for `root`.
///
/// `candidates` are the fragments managed by this controller; those that are
/// not leaves of the root's host are ignored. `resolve` is called for the root
/// and for every leaf that survives path claiming.
///
/// A root that is malformed or fails to resolve rejects the whole site. A
/// leaf that is malformed, declares TLS or fails to resolve is dropped with a
/// diagnostic, as is every path already claimed by an older leaf.
pub fn build_composite<F>(
    root: RouteFragment,
    candidates: impl IntoIterator<Item = RouteFragment>,
    mut resolve: F,
) -> Result<CompositeSite, MergeError>
where
    F: FnMut(RouteFragment) -> Result<ResolvedFragment, ResolveError>,
{
    let root = validate_root(root)?;
    let host = root.host().unwrap_or_default().to_string();
    let root_key = root.key.clone();
    let master = resolve(root).map_err(|source| match source {
        ResolveError::Cache(err) => MergeError::Cache(err),
        source => MergeError::RootResolve {
            key: root_key.clone(),
            source,
        },
    })?;

    let mut leaves: Vec<RouteFragment> = candidates
        .into_iter()
        .filter(|leaf| is_leaf_for_host(leaf, &host))
        .collect();
    leaves.sort_by(RouteFragment::creation_order);

    let mut diagnostics = Vec::new();
    let mut minions = Vec::new();
    let mut claimed: HashSet<String> = HashSet::new();

    for mut leaf in leaves {
        if let Some(message) = leaf_shape_error(&leaf) {
            diagnostics.push(MergeDiagnostic::new(&leaf.key, message));
            continue;
        }

        if leaf.declares_tls() {
            diagnostics.push(MergeDiagnostic::new(
                &leaf.key,
                format!(
                    "Ingress Resource {} with the 'nginx.org/mergeable-ingress-type' annotation set to 'minion' cannot contain TLS. It will be ignored",
                    leaf.key
                ),
            ));
            continue;
        }

        if let Some(paths) = leaf.rules[0].paths.as_mut() {
            paths.retain(|rule| {
                if claimed.insert(rule.path.clone()) {
                    return true;
                }
                diagnostics.push(MergeDiagnostic::new(
                    &leaf.key,
                    format!(
                        "Path {} for Ingress Resource {} will be ignored since it is already defined by another minion",
                        rule.path, leaf.key
                    ),
                ));
                false
            });
        }

        let key = leaf.key.clone();
        match resolve(leaf) {
            Ok(resolved) => minions.push(resolved),
            Err(ResolveError::Cache(err)) => return Err(MergeError::Cache(err)),
            Err(err) => diagnostics.push(MergeDiagnostic::new(
                &key,
                format!("Ingress Resource {} is ignored: {}", key, err),
            )),
        }
    }

    Ok(CompositeSite {
        master,
        minions,
        diagnostics,
    })
}

/// The live root a leaf belongs to: same host, role master.
///
/// `is_live` answers whether a candidate root is currently applied.
pub fn find_root<'f>(
    leaf: &RouteFragment,
    candidates: impl IntoIterator<Item = &'f RouteFragment>,
    is_live: impl Fn(&ResourceKey) -> bool,
) -> Option<&'f RouteFragment> {
    let host = leaf.host()?;
    candidates.into_iter().find(|root| {
        root.role == FragmentRole::CompositeRoot
            && root.host() == Some(host)
            && is_live(&root.key)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::reconcile::fragment::{BackendPort, BackendRef, HostRule, PathRule, TlsRef};
    use k8s_openapi::api::networking::v1::Ingress;
    use serde_json::json;

    fn fragment(name: &str, role: &str, created: &str, paths: Option<&[&str]>) -> RouteFragment {
        let ing: Ingress = serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": "default",
                "creationTimestamp": created,
                "annotations": {"nginx.org/mergeable-ingress-type": role}
            },
            "spec": {"rules": [{"host": "ok.com"}]}
        }))
        .unwrap();
        let mut fragment = RouteFragment::from_ingress(&ing);
        fragment.rules[0].paths = paths.map(|paths| {
            paths
                .iter()
                .map(|p| PathRule {
                    path: p.to_string(),
                    backend: BackendRef::new(format!("{}-svc", name), BackendPort::Number(80)),
                })
                .collect()
        });
        fragment
    }

    fn resolve_ok(f: RouteFragment) -> Result<ResolvedFragment, ResolveError> {
        Ok(ResolvedFragment::new(f))
    }

    fn paths(site: &CompositeSite) -> Vec<(String, String)> {
        site.minions
            .iter()
            .flat_map(|m| {
                m.fragment.rules[0]
                    .paths
                    .iter()
                    .flatten()
                    .map(|p| (m.fragment.key.name.clone(), p.path.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_root_must_have_one_rule_without_paths() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let validated = validate_root(root).unwrap();
        assert_eq!(validated.rules[0].paths, Some(vec![]), "Empty paths are injected");

        let with_paths = fragment("master", "master", "2024-01-01T00:00:00Z", Some(&["/"]));
        assert!(matches!(
            validate_root(with_paths),
            Err(MergeError::InvalidRoot { .. })
        ));

        let mut two_rules = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        two_rules.rules.push(HostRule {
            host: "other.com".to_string(),
            paths: None,
        });
        assert!(matches!(
            validate_root(two_rules),
            Err(MergeError::InvalidRoot { .. })
        ));
    }

    #[test]
    fn test_two_leaves_with_distinct_paths() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let tea = fragment("tea", "minion", "2024-01-02T00:00:00Z", Some(&["/tea"]));
        let coffee = fragment("coffee", "minion", "2024-01-03T00:00:00Z", Some(&["/coffee"]));

        let site = build_composite(root, vec![coffee, tea], resolve_ok).unwrap();

        assert_eq!(
            paths(&site),
            vec![
                ("tea".to_string(), "/tea".to_string()),
                ("coffee".to_string(), "/coffee".to_string())
            ],
            "Leaves are ordered by creation time"
        );
        assert!(site.diagnostics.is_empty());
    }

    #[test]
    fn test_path_collision_earlier_leaf_wins() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let older = fragment("coffee-v1", "minion", "2024-01-02T00:00:00Z", Some(&["/coffee"]));
        let newer = fragment("coffee-v2", "minion", "2024-01-03T00:00:00Z", Some(&["/coffee", "/mocha"]));

        // RED: arrival order must not matter
        let a = build_composite(root.clone(), vec![newer.clone(), older.clone()], resolve_ok).unwrap();
        let b = build_composite(root, vec![older, newer], resolve_ok).unwrap();

        assert_eq!(a, b, "Merge must be deterministic");
        assert_eq!(
            paths(&a),
            vec![
                ("coffee-v1".to_string(), "/coffee".to_string()),
                ("coffee-v2".to_string(), "/mocha".to_string())
            ]
        );
        assert_eq!(a.diagnostics.len(), 1, "Exactly one diagnostic for the dropped path");
        assert_eq!(a.diagnostics[0].key.name, "coffee-v2");
    }

    #[test]
    fn test_leaf_with_tls_is_rejected() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let mut tea = fragment("tea", "minion", "2024-01-02T00:00:00Z", Some(&["/tea"]));
        tea.tls.push(TlsRef {
            hosts: vec!["ok.com".to_string()],
            secret_name: "tea-secret".to_string(),
        });

        let site = build_composite(root, vec![tea], resolve_ok).unwrap();
        assert!(site.minions.is_empty());
        assert_eq!(site.diagnostics.len(), 1);
    }

    #[test]
    fn test_leaves_of_other_hosts_are_ignored() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let mut other = fragment("tea", "minion", "2024-01-02T00:00:00Z", Some(&["/tea"]));
        other.rules[0].host = "other.com".to_string();
        let simple = fragment("simple", "", "2024-01-02T00:00:00Z", Some(&["/s"]));

        let site = build_composite(root, vec![other, simple], resolve_ok).unwrap();
        assert!(site.minions.is_empty());
        assert!(site.diagnostics.is_empty());
    }

    #[test]
    fn test_malformed_leaf_for_host_gets_a_diagnostic() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let mut two_hosts = fragment("tea", "minion", "2024-01-02T00:00:00Z", Some(&["/tea"]));
        two_hosts.rules.push(HostRule {
            host: "other.com".to_string(),
            paths: None,
        });
        let no_http = fragment("coffee", "minion", "2024-01-03T00:00:00Z", None);
        let good = fragment("mocha", "minion", "2024-01-04T00:00:00Z", Some(&["/mocha"]));

        let site = build_composite(root, vec![two_hosts, no_http, good], resolve_ok).unwrap();

        assert_eq!(paths(&site), vec![("mocha".to_string(), "/mocha".to_string())]);
        assert_eq!(site.diagnostics.len(), 2);
        assert_eq!(site.diagnostics[0].key.name, "tea");
        assert!(site.diagnostics[0].message.contains("must contain only one host"));
        assert_eq!(site.diagnostics[1].key.name, "coffee");
        assert!(site.diagnostics[1].message.contains("must contain a Path"));
    }

    #[test]
    fn test_failing_leaf_is_dropped_but_root_survives() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let tea = fragment("tea", "minion", "2024-01-02T00:00:00Z", Some(&["/tea"]));
        let coffee = fragment("coffee", "minion", "2024-01-03T00:00:00Z", Some(&["/coffee"]));

        let site = build_composite(root, vec![tea, coffee], |f| {
            if f.key.name == "tea" {
                Err(ResolveError::EmptyHost)
            } else {
                Ok(ResolvedFragment::new(f))
            }
        })
        .unwrap();

        assert_eq!(site.minions.len(), 1);
        assert_eq!(site.diagnostics.len(), 1);
    }

    #[test]
    fn test_cache_error_is_transient() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let err = build_composite(root, Vec::new(), |_| {
            Err(ResolveError::Cache(CacheError::Unavailable("services".to_string())))
        })
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_find_root_requires_live_master_on_same_host() {
        let root = fragment("master", "master", "2024-01-01T00:00:00Z", None);
        let leaf = fragment("tea", "minion", "2024-01-02T00:00:00Z", Some(&["/tea"]));
        let candidates = vec![root.clone()];

        assert_eq!(find_root(&leaf, &candidates, |_| true), Some(&root));
        assert_eq!(find_root(&leaf, &candidates, |_| false), None, "Root must be live");
    }
}
