//! Route fragments
//!
//! A `RouteFragment` is the controller's view of one submitted Ingress: its
//! identity, role, host rules and references. A `ResolvedFragment` adds the
//! dependencies read from the cache at reconciliation time.

use common::ResourceMeta;
use k8s_openapi::api::core::v1::{Probe, Secret};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::annotations::{JWT_KEY_ANNOTATION, MERGEABLE_INGRESS_TYPE_ANNOTATION};
use super::cache::ResourceKey;

/// Role of a fragment in a composite site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentRole {
    Simple,
    CompositeRoot,
    CompositeLeaf,
}

impl FragmentRole {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        match annotations
            .get(MERGEABLE_INGRESS_TYPE_ANNOTATION)
            .map(String::as_str)
        {
            Some("master") => FragmentRole::CompositeRoot,
            Some("minion") => FragmentRole::CompositeLeaf,
            _ => FragmentRole::Simple,
        }
    }
}

/// Service port as referenced by a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendPort {
    Number(i32),
    Name(String),
}

impl fmt::Display for BackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPort::Number(n) => write!(f, "{}", n),
            BackendPort::Name(name) => f.write_str(name),
        }
    }
}

/// Reference from a rule to a Service port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendRef {
    pub service: String,
    pub port: BackendPort,
}

impl BackendRef {
    pub fn new(service: impl Into<String>, port: BackendPort) -> Self {
        Self {
            service: service.into(),
            port,
        }
    }

    /// Only Service backends are supported. Resource backends are ignored.
    fn from_ingress_backend(backend: &IngressBackend) -> Option<Self> {
        let service = backend.service.as_ref()?;
        let port = service.port.as_ref()?;
        let port = match (&port.name, port.number) {
            (Some(name), _) if !name.is_empty() => BackendPort::Name(name.clone()),
            (_, Some(number)) => BackendPort::Number(number),
            _ => return None,
        };
        Some(Self::new(service.name.clone(), port))
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    /// Empty means `/`
    pub path: String,
    pub backend: BackendRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRule {
    pub host: String,
    /// `None` when the rule has no http section (skipped during assembly)
    pub paths: Option<Vec<PathRule>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRef {
    pub hosts: Vec<String>,
    /// Empty when the entry names no secret
    pub secret_name: String,
}

/// One submitted routing resource
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFragment {
    pub key: ResourceKey,
    pub role: FragmentRole,
    pub annotations: BTreeMap<String, String>,
    pub default_backend: Option<BackendRef>,
    pub rules: Vec<HostRule>,
    pub tls: Vec<TlsRef>,
    pub created_at: Option<Time>,
}

impl RouteFragment {
    pub fn from_ingress(ing: &Ingress) -> Self {
        let annotations = ing.metadata.annotations.clone().unwrap_or_default();
        let spec = ing.spec.as_ref();

        let rules = spec
            .and_then(|s| s.rules.as_ref())
            .map(|rules| {
                rules
                    .iter()
                    .map(|rule| HostRule {
                        host: rule.host.clone().unwrap_or_default(),
                        paths: rule.http.as_ref().map(|http| {
                            http.paths
                                .iter()
                                .filter_map(|p| {
                                    Some(PathRule {
                                        path: p.path.clone().unwrap_or_default(),
                                        backend: BackendRef::from_ingress_backend(&p.backend)?,
                                    })
                                })
                                .collect()
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tls = spec
            .and_then(|s| s.tls.as_ref())
            .map(|entries| {
                entries
                    .iter()
                    .map(|t| TlsRef {
                        hosts: t.hosts.clone().unwrap_or_default(),
                        secret_name: t.secret_name.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            key: ResourceKey::of(ing),
            role: FragmentRole::from_annotations(&annotations),
            default_backend: spec
                .and_then(|s| s.default_backend.as_ref())
                .and_then(BackendRef::from_ingress_backend),
            annotations,
            rules,
            tls,
            created_at: ing.metadata.creation_timestamp.clone(),
        }
    }

    pub fn meta(&self) -> ResourceMeta {
        ResourceMeta {
            namespace: self.key.namespace.clone(),
            name: self.key.name.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// Host of the first rule; composite participants have exactly one
    pub fn host(&self) -> Option<&str> {
        self.rules.first().map(|r| r.host.as_str())
    }

    /// Every backend reference: default backend first, then paths in order
    pub fn backends(&self) -> impl Iterator<Item = &BackendRef> {
        self.default_backend.iter().chain(
            self.rules
                .iter()
                .filter_map(|r| r.paths.as_ref())
                .flatten()
                .map(|p| &p.backend),
        )
    }

    pub fn references_service(&self, service: &str) -> bool {
        self.backends().any(|b| b.service == service)
    }

    pub fn references_secret(&self, secret: &str, nginx_plus: bool) -> bool {
        self.tls.iter().any(|t| t.secret_name == secret)
            || (nginx_plus
                && self.annotations.get(JWT_KEY_ANNOTATION).map(String::as_str) == Some(secret))
    }

    pub fn declares_tls(&self) -> bool {
        !self.tls.is_empty()
    }

    /// Creation-time order with a namespace/name tie-break.
    ///
    /// This is the only ordering used for composite leaves: it decides path
    /// ownership and location order.
    pub fn creation_order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

// ============================================================================
// Resolved dependencies
// ============================================================================

/// Active health check parameters taken from a readiness probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthProbe {
    pub path: String,
    pub scheme: String,
    pub headers: BTreeMap<String, String>,
    pub period_seconds: i32,
    pub failure_threshold: i32,
    pub success_threshold: i32,
    pub timeout_seconds: i32,
}

impl HealthProbe {
    /// Only HTTP probes with a positive period are usable
    pub fn from_probe(probe: &Probe) -> Option<Self> {
        let http = probe.http_get.as_ref()?;
        let period_seconds = probe.period_seconds.unwrap_or(0);
        if period_seconds <= 0 {
            return None;
        }
        Some(Self {
            path: http.path.clone().unwrap_or_default(),
            scheme: http.scheme.clone().unwrap_or_else(|| "HTTP".to_string()),
            headers: http
                .http_headers
                .iter()
                .flatten()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            period_seconds,
            failure_threshold: probe.failure_threshold.unwrap_or(3),
            success_threshold: probe.success_threshold.unwrap_or(1),
            timeout_seconds: probe.timeout_seconds.unwrap_or(1),
        })
    }
}

/// JWK secret referenced by a fragment
#[derive(Debug, Clone, PartialEq)]
pub struct JwtKey {
    /// Secret name as written in the annotation
    pub name: String,
    /// `None` when the secret is missing or invalid
    pub secret: Option<Arc<Secret>>,
}

/// A fragment plus everything it references, read from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFragment {
    pub fragment: RouteFragment,
    /// Validated TLS secrets by secret name
    pub tls_secrets: BTreeMap<String, Arc<Secret>>,
    pub jwt_key: Option<JwtKey>,
    /// `address:port` members per backend; empty when unresolvable
    pub endpoints: HashMap<BackendRef, Vec<String>>,
    pub health_probes: HashMap<BackendRef, HealthProbe>,
    /// Services of type ExternalName, resolved by DNS in the proxy
    pub external_name_services: HashSet<String>,
}

impl ResolvedFragment {
    pub fn new(fragment: RouteFragment) -> Self {
        Self {
            fragment,
            tls_secrets: BTreeMap::new(),
            jwt_key: None,
            endpoints: HashMap::new(),
            health_probes: HashMap::new(),
            external_name_services: HashSet::new(),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.fragment.key
    }
}
