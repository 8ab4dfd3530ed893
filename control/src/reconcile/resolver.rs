//! Fragment Resolver
//!
//! Turns a `RouteFragment` into a `ResolvedFragment` by reading its Services,
//! EndpointSlices, Pods and Secrets from the cache.
//!
//! Resolution degrades per backend: a Service or its endpoints missing from
//! the cache yields an empty member list, never a failed fragment. Only a
//! fragment with nothing routable (or an empty host) is rejected.

use k8s_openapi::api::core::v1::{Pod, Probe, Secret, Service, ServicePort};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::annotations::{health_checks_requested, JWT_KEY_ANNOTATION};
use super::cache::{CacheError, ResourceKey, Stores};
use super::fragment::{BackendPort, BackendRef, HealthProbe, JwtKey, ResolvedFragment, RouteFragment};
use super::secrets::{validate_jwk_secret, validate_tls_secret, SecretError};

const EXTERNAL_NAME_TYPE: &str = "ExternalName";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Service {0} doesn't exist")]
    MissingService(String),

    #[error("No endpoints for {0}")]
    MissingEndpoints(String),

    #[error("Secret {0} doesn't exist")]
    MissingSecret(String),

    #[error("Secret {name} is invalid: {source}")]
    InvalidSecret { name: String, source: SecretError },

    #[error("Ingress contains no valid rules")]
    NoValidRules,

    #[error("Ingress rule contains empty host")]
    EmptyHost,

    #[error("Type ExternalName Services feature is only available in NGINX Plus ({0})")]
    ExternalNameRequiresPlus(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::Cache(_))
    }
}

/// Members of one backend plus whether they are DNS names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendEndpoints {
    pub endpoints: Vec<String>,
    pub external: bool,
}

/// Resolves fragments against the resource cache
pub struct Resolver<'a> {
    stores: &'a Stores,
    nginx_plus: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(stores: &'a Stores, nginx_plus: bool) -> Self {
        Self { stores, nginx_plus }
    }

    /// Resolve every dependency of `fragment`.
    ///
    /// Fails with `NoValidRules` when no rule has an http section and there is
    /// no default backend, and with `EmptyHost` when a routable rule has no host.
    pub fn resolve(&self, fragment: RouteFragment) -> Result<ResolvedFragment, ResolveError> {
        let routable = fragment.rules.iter().filter(|r| r.paths.is_some());
        let mut valid_rules = 0;
        for rule in routable {
            if rule.host.is_empty() {
                return Err(ResolveError::EmptyHost);
            }
            valid_rules += 1;
        }
        if valid_rules == 0 && fragment.default_backend.is_none() {
            return Err(ResolveError::NoValidRules);
        }

        let namespace = fragment.key.namespace.clone();
        let mut resolved = ResolvedFragment::new(fragment);

        for tls in &resolved.fragment.tls {
            if tls.secret_name.is_empty() {
                continue;
            }
            match self.tls_secret(&namespace, &tls.secret_name) {
                Ok(secret) => {
                    resolved.tls_secrets.insert(tls.secret_name.clone(), secret);
                }
                Err(err @ ResolveError::Cache(_)) => return Err(err),
                Err(err) => warn!(
                    "Error trying to get the secret {} for Ingress {}: {}",
                    tls.secret_name, resolved.fragment.key, err
                ),
            }
        }

        if self.nginx_plus {
            if let Some(name) = resolved.fragment.annotations.get(JWT_KEY_ANNOTATION) {
                let secret = match self.jwk_secret(&namespace, name) {
                    Ok(secret) => Some(secret),
                    Err(err @ ResolveError::Cache(_)) => return Err(err),
                    Err(err) => {
                        warn!(
                            "Error retrieving secret {} for Ingress {}: {}",
                            name, resolved.fragment.key, err
                        );
                        None
                    }
                };
                resolved.jwt_key = Some(JwtKey {
                    name: name.clone(),
                    secret,
                });
            }
        }

        let health_checks =
            health_checks_requested(&resolved.fragment.annotations, self.nginx_plus);
        let backends: Vec<BackendRef> = resolved.fragment.backends().cloned().collect();

        for backend in backends {
            if resolved.endpoints.contains_key(&backend) {
                continue;
            }
            let members = match self.backend_endpoints(&namespace, &backend) {
                Ok(members) => members,
                Err(err @ ResolveError::Cache(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        "Error retrieving endpoints for the service {}: {}",
                        backend.service, err
                    );
                    BackendEndpoints::default()
                }
            };
            if members.external {
                resolved
                    .external_name_services
                    .insert(backend.service.clone());
            }

            if health_checks {
                match self.health_probe(&namespace, &backend)? {
                    Some(probe) => {
                        resolved.health_probes.insert(backend.clone(), probe);
                    }
                    None => debug!(
                        "No usable readiness probe for {} in {}",
                        backend, resolved.fragment.key
                    ),
                }
            }

            resolved.endpoints.insert(backend, members.endpoints);
        }

        Ok(resolved)
    }

    /// Validated TLS secret in `namespace`
    pub fn tls_secret(&self, namespace: &str, name: &str) -> Result<Arc<Secret>, ResolveError> {
        let secret = self.secret(namespace, name)?;
        validate_tls_secret(&secret).map_err(|source| ResolveError::InvalidSecret {
            name: name.to_string(),
            source,
        })?;
        Ok(secret)
    }

    fn jwk_secret(&self, namespace: &str, name: &str) -> Result<Arc<Secret>, ResolveError> {
        let secret = self.secret(namespace, name)?;
        validate_jwk_secret(&secret).map_err(|source| ResolveError::InvalidSecret {
            name: name.to_string(),
            source,
        })?;
        Ok(secret)
    }

    fn secret(&self, namespace: &str, name: &str) -> Result<Arc<Secret>, ResolveError> {
        let key = ResourceKey::new(namespace, name);
        self.stores
            .secrets
            .get_by_key(&key)?
            .ok_or_else(|| ResolveError::MissingSecret(key.to_string()))
    }

    fn service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, ResolveError> {
        let key = ResourceKey::new(namespace, name);
        self.stores
            .services
            .get_by_key(&key)?
            .ok_or_else(|| ResolveError::MissingService(key.to_string()))
    }

    /// Members for one backend: ready endpoints of the matching port, or the
    /// external name of an ExternalName Service (Plus only).
    pub fn backend_endpoints(
        &self,
        namespace: &str,
        backend: &BackendRef,
    ) -> Result<BackendEndpoints, ResolveError> {
        let service = self.service(namespace, &backend.service)?;
        let spec = service.spec.as_ref();

        let port = spec
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| service_port(ports, &backend.port));

        if spec.and_then(|s| s.type_.as_deref()) == Some(EXTERNAL_NAME_TYPE) {
            if !self.nginx_plus {
                return Err(ResolveError::ExternalNameRequiresPlus(backend.service.clone()));
            }
            let external_name = spec
                .and_then(|s| s.external_name.as_deref())
                .unwrap_or_default();
            let number = match (&backend.port, port) {
                (BackendPort::Number(n), _) => *n,
                (BackendPort::Name(_), Some(p)) => p.port,
                (BackendPort::Name(_), None) => 0,
            };
            return Ok(BackendEndpoints {
                endpoints: vec![format!("{}:{}", external_name, number)],
                external: true,
            });
        }

        let port = port.ok_or_else(|| {
            ResolveError::MissingEndpoints(format!(
                "port {} in service {}",
                backend.port, backend.service
            ))
        })?;

        let slices = self
            .stores
            .endpoint_slices_for_service(namespace, &backend.service)?;
        let endpoints = endpoints_for_port(&slices, port);
        if endpoints.is_empty() {
            return Err(ResolveError::MissingEndpoints(format!(
                "target port of {} in service {}",
                backend.port, backend.service
            )));
        }

        Ok(BackendEndpoints {
            endpoints,
            external: false,
        })
    }

    /// Endpoints for a VirtualServer upstream. Errors are logged and yield no members.
    pub fn endpoints_for_service(
        &self,
        namespace: &str,
        service: &str,
        port: u16,
    ) -> Result<Vec<String>, CacheError> {
        let backend = BackendRef::new(service, BackendPort::Number(i32::from(port)));
        match self.backend_endpoints(namespace, &backend) {
            Ok(members) => Ok(members.endpoints),
            Err(ResolveError::Cache(err)) => Err(err),
            Err(err) => {
                warn!(
                    "Error retrieving endpoints for the service {}: {}",
                    service, err
                );
                Ok(Vec::new())
            }
        }
    }

    fn health_probe(
        &self,
        namespace: &str,
        backend: &BackendRef,
    ) -> Result<Option<HealthProbe>, ResolveError> {
        let service = match self.service(namespace, &backend.service) {
            Ok(service) => service,
            Err(ResolveError::MissingService(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(spec) = service.spec.as_ref() else {
            return Ok(None);
        };
        let Some(port) = spec
            .ports
            .as_ref()
            .and_then(|ports| service_port(ports, &backend.port))
        else {
            return Ok(None);
        };
        let selector = spec.selector.clone().unwrap_or_default();
        let pods = self.stores.pods_for_selector(namespace, &selector)?;

        Ok(find_probe_for_pods(&pods, port).and_then(HealthProbe::from_probe))
    }
}

fn service_port<'p>(ports: &'p [ServicePort], port: &BackendPort) -> Option<&'p ServicePort> {
    ports.iter().find(|p| match port {
        BackendPort::Number(n) => p.port == *n,
        BackendPort::Name(name) => p.name.as_deref() == Some(name.as_str()),
    })
}

/// Ready endpoints of the slice port named like the Service port, as sorted
/// unique `address:port` strings. IPv6 addresses are bracketed.
pub(crate) fn endpoints_for_port(slices: &[Arc<EndpointSlice>], port: &ServicePort) -> Vec<String> {
    let port_name = port.name.as_deref().unwrap_or_default();
    let mut endpoints = BTreeSet::new();

    for slice in slices {
        let Some(slice_port) = slice
            .ports
            .iter()
            .flatten()
            .find(|p| p.name.as_deref().unwrap_or_default() == port_name)
            .and_then(|p| p.port)
        else {
            continue;
        };
        let ipv6 = slice.address_type == "IPv6";

        for endpoint in &slice.endpoints {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if !ready {
                continue;
            }
            for address in &endpoint.addresses {
                if ipv6 {
                    endpoints.insert(format!("[{}]:{}", address, slice_port));
                } else {
                    endpoints.insert(format!("{}:{}", address, slice_port));
                }
            }
        }
    }

    endpoints.into_iter().collect()
}

/// Readiness probe of the first pod's container serving `port`.
///
/// Only HTTP probes with a positive period qualify.
pub(crate) fn find_probe_for_pods<'p>(pods: &'p [Arc<Pod>], port: &ServicePort) -> Option<&'p Probe> {
    let pod = pods.first()?;
    let spec = pod.spec.as_ref()?;
    for container in &spec.containers {
        for container_port in container.ports.iter().flatten() {
            if !container_port_matches(container_port, port) {
                continue;
            }
            if let Some(probe) = &container.readiness_probe {
                if probe.http_get.is_some() && probe.period_seconds.unwrap_or(0) > 0 {
                    return Some(probe);
                }
            }
        }
    }
    None
}

fn container_port_matches(
    container_port: &k8s_openapi::api::core::v1::ContainerPort,
    port: &ServicePort,
) -> bool {
    match &port.target_port {
        None => port.port > 0 && port.port == container_port.container_port,
        Some(IntOrString::Int(target)) => *target > 0 && *target == container_port.container_port,
        Some(IntOrString::String(name)) => {
            let protocol = |p: Option<&str>| p.unwrap_or("TCP").to_string();
            container_port.name.as_deref() == Some(name.as_str())
                && protocol(port.protocol.as_deref()) == protocol(container_port.protocol.as_deref())
        }
    }
}
