//! Merge Engine for VirtualServers
//!
//! A VirtualServer is the root of its own composite. A route with a `route`
//! field delegates its path prefix to a VirtualServerRoute, which becomes a
//! leaf of the site once it is checked against the root: same host, every
//! subroute under the delegated prefix, no duplicate paths.
//!
//! A missing or invalid VirtualServerRoute is a leaf failure. It is reported
//! and left out of the merge while the VirtualServer itself still applies.

use common::endpoints_key;
use k8s_openapi::api::core::v1::Secret;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::cache::{CacheError, ResourceKey, Stores};
use super::merge::MergeDiagnostic;
use super::resolver::{ResolveError, Resolver};
use crate::apis::crd::{VirtualServer, VirtualServerRoute, VsRoute, VsUpstream};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VirtualServerError {
    #[error("spec.host: Required value")]
    EmptyHost,

    #[error("spec.host: Invalid value: \"{host}\": must be equal to '{expected}'")]
    HostMismatch { host: String, expected: String },

    #[error("spec.upstreams: Invalid value: \"{0}\": upstream name and service are required and names must be unique")]
    InvalidUpstream(String),

    #[error("route {path}: {message}")]
    InvalidRoute { path: String, message: String },

    #[error("route {0}: Duplicate value")]
    DuplicatePath(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl VirtualServerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VirtualServerError::Cache(_))
    }
}

// =============================================================================
// Validation
// =============================================================================

fn is_valid_path(path: &str) -> bool {
    path.starts_with('/')
        && !path
            .chars()
            .any(|c| c.is_whitespace() || c == '{' || c == '}' || c == ';')
}

fn upstream_names(upstreams: &[VsUpstream]) -> Result<HashSet<&str>, VirtualServerError> {
    let mut names = HashSet::new();
    for upstream in upstreams {
        if upstream.name.is_empty()
            || upstream.service.is_empty()
            || !names.insert(upstream.name.as_str())
        {
            return Err(VirtualServerError::InvalidUpstream(upstream.name.clone()));
        }
    }
    Ok(names)
}

fn referenced(name: &str, upstreams: &HashSet<&str>) -> Result<(), String> {
    if upstreams.contains(name) {
        Ok(())
    } else {
        Err(format!("upstream '{}' not found", name))
    }
}

/// A route must carry exactly one action and reference only declared upstreams
fn validate_route(
    route: &VsRoute,
    upstreams: &HashSet<&str>,
    route_allowed: bool,
) -> Result<(), VirtualServerError> {
    let invalid = |message: String| VirtualServerError::InvalidRoute {
        path: route.path.clone(),
        message,
    };

    if !is_valid_path(&route.path) {
        return Err(invalid(
            "must start with / and must not include any whitespace character, `{`, `}` or `;`"
                .to_string(),
        ));
    }

    let mut actions = 0;

    if !route.upstream.is_empty() {
        referenced(&route.upstream, upstreams).map_err(invalid)?;
        actions += 1;
    }

    if !route.splits.is_empty() {
        if route.splits.len() < 2 {
            return Err(invalid("must include at least 2 splits".to_string()));
        }
        let mut total = 0;
        for split in &route.splits {
            if !(1..=99).contains(&split.weight) {
                return Err(invalid(format!(
                    "split weight {} must be between 1 and 99",
                    split.weight
                )));
            }
            referenced(&split.upstream, upstreams).map_err(invalid)?;
            total += split.weight;
        }
        if total != 100 {
            return Err(invalid(
                "the sum of the weights of all splits must be equal to 100".to_string(),
            ));
        }
        actions += 1;
    }

    if let Some(rules) = &route.rules {
        if rules.conditions.is_empty() {
            return Err(invalid("must specify at least one condition".to_string()));
        }
        if rules.matches.is_empty() {
            return Err(invalid("must specify at least one match".to_string()));
        }
        for condition in &rules.conditions {
            let set = [
                &condition.header,
                &condition.cookie,
                &condition.argument,
                &condition.variable,
            ]
            .iter()
            .filter(|field| !field.is_empty())
            .count();
            if set != 1 {
                return Err(invalid(
                    "condition must specify exactly one of: `header`, `cookie`, `argument` or `variable`"
                        .to_string(),
                ));
            }
        }
        for matched in &rules.matches {
            if matched.values.len() != rules.conditions.len() {
                return Err(invalid(format!(
                    "must specify {} values (same as the number of conditions)",
                    rules.conditions.len()
                )));
            }
            referenced(&matched.upstream, upstreams).map_err(invalid)?;
        }
        referenced(&rules.default_upstream, upstreams).map_err(invalid)?;
        actions += 1;
    }

    if !route.route.is_empty() {
        if !route_allowed {
            return Err(invalid("route is not allowed".to_string()));
        }
        actions += 1;
    }

    if actions != 1 {
        let message = if route_allowed {
            "must specify exactly one of: `upstream`, `splits`, `rules` or `route`"
        } else {
            "must specify exactly one of: `upstream`, `splits` or `rules`"
        };
        return Err(invalid(message.to_string()));
    }

    Ok(())
}

pub fn validate_virtual_server(vs: &VirtualServer) -> Result<(), VirtualServerError> {
    if vs.spec.host.is_empty() {
        return Err(VirtualServerError::EmptyHost);
    }
    let upstreams = upstream_names(&vs.spec.upstreams)?;

    let mut paths = HashSet::new();
    for route in &vs.spec.routes {
        validate_route(route, &upstreams, true)?;
        if !paths.insert(route.path.as_str()) {
            return Err(VirtualServerError::DuplicatePath(route.path.clone()));
        }
    }
    Ok(())
}

/// Check a VirtualServerRoute against the host and path prefix of the
/// VirtualServer route delegating to it
pub fn validate_route_for_virtual_server(
    vsr: &VirtualServerRoute,
    host: &str,
    path_prefix: &str,
) -> Result<(), VirtualServerError> {
    if vsr.spec.host.is_empty() {
        return Err(VirtualServerError::EmptyHost);
    }
    if vsr.spec.host != host {
        return Err(VirtualServerError::HostMismatch {
            host: vsr.spec.host.clone(),
            expected: host.to_string(),
        });
    }
    let upstreams = upstream_names(&vsr.spec.upstreams)?;

    let mut paths = HashSet::new();
    for subroute in &vsr.spec.subroutes {
        validate_route(subroute, &upstreams, false)?;
        if !subroute.path.starts_with(path_prefix) {
            return Err(VirtualServerError::InvalidRoute {
                path: subroute.path.clone(),
                message: format!("must start with '{}'", path_prefix),
            });
        }
        if !paths.insert(subroute.path.as_str()) {
            return Err(VirtualServerError::DuplicatePath(subroute.path.clone()));
        }
    }
    Ok(())
}

// =============================================================================
// VirtualServerSite
// =============================================================================

/// A VirtualServer with its merged routes and everything they resolve to
#[derive(Debug, Clone)]
pub struct VirtualServerSite {
    pub virtual_server: Arc<VirtualServer>,
    /// In the order the VirtualServer references them
    pub routes: Vec<Arc<VirtualServerRoute>>,
    /// Members keyed by `namespace/service:port`
    pub endpoints: HashMap<String, Vec<String>>,
    /// Validated TLS secret, `None` when unset, missing or invalid
    pub tls_secret: Option<Arc<Secret>>,
    /// Route references that were left out
    pub diagnostics: Vec<MergeDiagnostic>,
}

impl VirtualServerSite {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::of(self.virtual_server.as_ref())
    }

    pub fn host(&self) -> &str {
        &self.virtual_server.spec.host
    }

    pub fn namespace(&self) -> &str {
        self.virtual_server
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default()
    }

    pub fn route_keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.routes.iter().map(|vsr| ResourceKey::of(vsr.as_ref()))
    }

    /// Name of the TLS secret the VirtualServer asks for, if any
    pub fn tls_secret_name(&self) -> Option<&str> {
        self.virtual_server
            .spec
            .tls
            .as_ref()
            .map(|tls| tls.secret.as_str())
            .filter(|secret| !secret.is_empty())
    }

    pub fn references_service(&self, namespace: &str, service: &str) -> bool {
        let in_vs = self.namespace() == namespace
            && self
                .virtual_server
                .spec
                .upstreams
                .iter()
                .any(|u| u.service == service);
        in_vs
            || self.routes.iter().any(|vsr| {
                vsr.metadata.namespace.as_deref() == Some(namespace)
                    && vsr.spec.upstreams.iter().any(|u| u.service == service)
            })
    }

    pub fn references_secret(&self, namespace: &str, secret: &str) -> bool {
        self.namespace() == namespace && self.tls_secret_name() == Some(secret)
    }
}

/// Does the VirtualServer delegate any path to `route`?
pub fn references_route(vs: &VirtualServer, route: &ResourceKey) -> bool {
    let namespace = vs.metadata.namespace.as_deref().unwrap_or_default();
    vs.spec
        .routes
        .iter()
        .filter_map(|r| r.route_key(namespace))
        .any(|key| ResourceKey::parse(&key).as_ref() == Some(route))
}

/// VirtualServers referencing `route`, ordered by key
pub fn find_virtual_servers_for_route(
    stores: &Stores,
    route: &ResourceKey,
) -> Result<Vec<Arc<VirtualServer>>, CacheError> {
    let mut found: Vec<Arc<VirtualServer>> = stores
        .virtual_servers
        .list()?
        .into_iter()
        .filter(|vs| references_route(vs, route))
        .collect();
    found.sort_by_key(|vs| ResourceKey::of(vs.as_ref()));
    Ok(found)
}

fn collect_endpoints(
    resolver: &Resolver<'_>,
    namespace: &str,
    upstreams: &[VsUpstream],
    endpoints: &mut HashMap<String, Vec<String>>,
) -> Result<(), CacheError> {
    for upstream in upstreams {
        let key = endpoints_key(namespace, &upstream.service, upstream.port);
        if endpoints.contains_key(&key) {
            continue;
        }
        let members = resolver.endpoints_for_service(namespace, &upstream.service, upstream.port)?;
        endpoints.insert(key, members);
    }
    Ok(())
}

/// Validate a VirtualServer, resolve its dependencies and merge the
/// VirtualServerRoutes it references.
///
/// Only an invalid VirtualServer or an unavailable cache fails the site.
pub fn build_virtual_server_site(
    vs: Arc<VirtualServer>,
    stores: &Stores,
    resolver: &Resolver<'_>,
) -> Result<VirtualServerSite, VirtualServerError> {
    validate_virtual_server(&vs)?;

    let key = ResourceKey::of(vs.as_ref());
    let namespace = key.namespace.clone();

    let mut tls_secret = None;
    if let Some(secret) = vs
        .spec
        .tls
        .as_ref()
        .map(|tls| tls.secret.as_str())
        .filter(|s| !s.is_empty())
    {
        match resolver.tls_secret(&namespace, secret) {
            Ok(s) => tls_secret = Some(s),
            Err(ResolveError::Cache(err)) => return Err(err.into()),
            Err(err) => warn!(key = %key, "TLS secret {} is invalid: {}", secret, err),
        }
    }

    let mut endpoints = HashMap::new();
    collect_endpoints(resolver, &namespace, &vs.spec.upstreams, &mut endpoints)?;

    let mut routes: Vec<Arc<VirtualServerRoute>> = Vec::new();
    let mut seen = HashSet::new();
    let mut diagnostics = Vec::new();

    for route in &vs.spec.routes {
        let Some(route_key) = route.route_key(&namespace) else {
            continue;
        };
        let Some(vsr_key) = ResourceKey::parse(&route_key) else {
            diagnostics.push(MergeDiagnostic::new(
                &key,
                format!("VirtualServerRoute reference {} is malformed", route_key),
            ));
            continue;
        };
        if !seen.insert(vsr_key.clone()) {
            debug!(key = %key, "VirtualServerRoute {} referenced more than once", vsr_key);
            continue;
        }

        let Some(vsr) = stores.virtual_server_routes.get_by_key(&vsr_key)? else {
            diagnostics.push(MergeDiagnostic::new(
                &vsr_key,
                format!("VirtualServerRoute {} doesn't exist", vsr_key),
            ));
            continue;
        };

        if let Err(err) = validate_route_for_virtual_server(&vsr, &vs.spec.host, &route.path) {
            diagnostics.push(MergeDiagnostic::new(
                &vsr_key,
                format!(
                    "VirtualServerRoute {} is invalid for VirtualServer {}: {}",
                    vsr_key, key, err
                ),
            ));
            continue;
        }

        collect_endpoints(resolver, &vsr_key.namespace, &vsr.spec.upstreams, &mut endpoints)?;
        routes.push(vsr);
    }

    Ok(VirtualServerSite {
        virtual_server: vs,
        routes,
        endpoints,
        tls_secret,
        diagnostics,
    })
}
