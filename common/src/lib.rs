//! Proxy Configuration Model
//!
//! Render-ready data structures shared by the reconciler and the renderers.
//! Nothing in here knows about Kubernetes: every value is already resolved
//! (endpoints are `address:port` strings, TLS material is a file path).
//!
//! Two families live side by side:
//! - `IngressConfig` for Ingress fragments and master/minion composites
//! - `VirtualServerConfig` for VirtualServer/VirtualServerRoute composites
//!
//! Naming functions are deterministic so that an incremental upstream update
//! always targets the same upstream a previous full render created.

use std::collections::BTreeMap;
use std::fmt;

/// Upstream member used when a backend has no endpoints (non-Plus Ingress).
/// Requests proxied to it fail with 502.
pub const DEFAULT_UPSTREAM_SERVER_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_UPSTREAM_SERVER_PORT: &str = "8181";

/// Upstream member used when a VirtualServer upstream has no endpoints (non-Plus).
pub const NGINX_502_SERVER: &str = "unix:/var/run/nginx-502-server.sock";

/// Cipher list that makes every TLS handshake fail.
pub const MISSING_SECRET_CIPHERS: &str = "NULL";

// ============================================================================
// Upstreams
// ============================================================================

/// A named pool of backend members with a load-balancing policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Upstream {
    pub name: String,
    pub servers: Vec<UpstreamServer>,
    /// Empty string means the proxy default (round robin)
    pub lb_method: String,
    pub keepalive: i64,
    pub sticky_cookie: String,
    /// Request queue length, non-zero only for mandatory health checks (Plus)
    pub queue: i64,
    pub queue_timeout: i64,
}

impl Upstream {
    /// Upstream whose only member answers every request with 502.
    pub fn with_default_server(name: impl Into<String>) -> Self {
        Upstream {
            name: name.into(),
            servers: vec![UpstreamServer {
                address: DEFAULT_UPSTREAM_SERVER_ADDRESS.to_string(),
                port: DEFAULT_UPSTREAM_SERVER_PORT.to_string(),
                max_fails: 1,
                max_conns: 0,
                fail_timeout: "10s".to_string(),
                slow_start: String::new(),
                resolve: false,
            }],
            ..Default::default()
        }
    }

    /// True if the only member is one of the 502 sentinels.
    pub fn is_sentinel(&self) -> bool {
        matches!(self.servers.as_slice(), [only] if only.is_sentinel())
    }
}

/// One member of an upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpstreamServer {
    pub address: String,
    /// Empty for unix socket members
    pub port: String,
    pub max_fails: i64,
    pub max_conns: i64,
    pub fail_timeout: String,
    pub slow_start: String,
    /// Member is a DNS name re-resolved by the proxy (ExternalName services)
    pub resolve: bool,
}

impl UpstreamServer {
    /// Build a member from an `address:port` endpoint string.
    ///
    /// The port is split at the last colon. Endpoints without a colon
    /// (unix sockets, bare names) keep an empty port.
    pub fn from_endpoint(endpoint: &str) -> Self {
        let (address, port) = split_endpoint(endpoint);
        UpstreamServer {
            address: address.to_string(),
            port: port.to_string(),
            ..Default::default()
        }
    }

    /// `address:port`, or just `address` when there is no port.
    pub fn endpoint(&self) -> String {
        if self.port.is_empty() {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.address == NGINX_502_SERVER
            || (self.address == DEFAULT_UPSTREAM_SERVER_ADDRESS
                && self.port == DEFAULT_UPSTREAM_SERVER_PORT)
    }
}

fn split_endpoint(endpoint: &str) -> (&str, &str) {
    if endpoint.starts_with("unix:") {
        return (endpoint, "");
    }
    match endpoint.rsplit_once(':') {
        Some((address, port)) => (address, port),
        None => (endpoint, ""),
    }
}

/// Per-member parameters pushed with an incremental upstream update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerParams {
    pub max_fails: i64,
    pub fail_timeout: String,
    pub slow_start: String,
}

// ============================================================================
// Ingress (v1) model
// ============================================================================

/// Identity of the resource a config (or a location inside it) came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceMeta {
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

/// Full config for one Ingress or one master/minion composite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IngressConfig {
    pub upstreams: Vec<Upstream>,
    pub servers: Vec<Server>,
    /// Empty when keepalive is disabled
    pub keepalive: String,
    pub ingress: ResourceMeta,
}

/// TLS termination settings for a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SslBinding {
    pub certificate: String,
    pub certificate_key: String,
    /// `NULL` when the referenced secret was missing or invalid
    pub ciphers: String,
}

impl SslBinding {
    /// Bind a single PEM file holding both certificate and key.
    pub fn from_pem(pem_file: &str, missing_pem_file: &str) -> Self {
        let ciphers = if pem_file == missing_pem_file {
            MISSING_SECRET_CIPHERS.to_string()
        } else {
            String::new()
        };
        SslBinding {
            certificate: pem_file.to_string(),
            certificate_key: pem_file.to_string(),
            ciphers,
        }
    }

    pub fn fails_closed(&self) -> bool {
        self.ciphers == MISSING_SECRET_CIPHERS
    }
}

/// A virtual server for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Server {
    pub name: String,
    pub server_tokens: String,
    pub server_snippets: Vec<String>,
    pub locations: Vec<Location>,
    pub ssl: Option<SslBinding>,
    pub grpc_only: bool,
    pub status_zone: String,
    pub http2: bool,
    pub redirect_to_https: bool,
    pub ssl_redirect: bool,
    pub proxy_protocol: bool,
    pub hsts: bool,
    pub hsts_max_age: i64,
    pub hsts_include_subdomains: bool,
    pub hsts_behind_proxy: bool,
    pub proxy_hide_headers: Vec<String>,
    pub proxy_pass_headers: Vec<String>,
    /// Keyed by upstream name
    pub health_checks: BTreeMap<String, HealthCheck>,
    pub real_ip_header: String,
    pub set_real_ip_from: Vec<String>,
    pub real_ip_recursive: bool,
    pub jwt_auth: Option<JwtAuth>,
    pub jwt_redirect_locations: Vec<JwtRedirectLocation>,
    pub ports: Vec<u16>,
    pub ssl_ports: Vec<u16>,
}

/// A path-scoped block proxying to one upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub path: String,
    /// Name of the upstream this location proxies to
    pub upstream: String,
    pub location_snippets: Vec<String>,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub proxy_send_timeout: String,
    pub client_max_body_size: String,
    pub websocket: bool,
    pub rewrite: String,
    pub ssl: bool,
    pub grpc: bool,
    pub proxy_buffering: bool,
    pub proxy_buffers: String,
    pub proxy_buffer_size: String,
    pub proxy_max_temp_file_size: String,
    pub jwt_auth: Option<JwtAuth>,
    /// Set when the location was contributed by a minion
    pub minion: Option<ResourceMeta>,
}

/// Active HTTP health check for one upstream (Plus).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HealthCheck {
    pub upstream_name: String,
    pub uri: String,
    pub interval: i32,
    pub fails: i32,
    pub passes: i32,
    pub scheme: String,
    pub mandatory: bool,
    pub headers: BTreeMap<String, String>,
    pub timeout_seconds: i64,
}

/// JWT validation settings (Plus).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JwtAuth {
    /// Path to the JWK file
    pub key: String,
    pub realm: String,
    pub token: String,
    pub redirect_location_name: String,
}

/// Named location redirecting unauthenticated clients to a login URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JwtRedirectLocation {
    pub name: String,
    pub login_url: String,
}

/// The main (http-level) proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MainConfig {
    pub server_names_hash_bucket_size: String,
    pub server_names_hash_max_size: String,
    pub access_log_off: bool,
    pub log_format: String,
    pub error_log_level: String,
    pub health_status: bool,
    pub nginx_status: bool,
    pub nginx_status_allow_cidrs: Vec<String>,
    pub nginx_status_port: u16,
    pub main_snippets: Vec<String>,
    pub http_snippets: Vec<String>,
    pub ssl_protocols: String,
    pub ssl_prefer_server_ciphers: bool,
    pub ssl_ciphers: String,
    pub http2: bool,
    pub server_tokens: String,
    pub proxy_protocol: bool,
    pub worker_processes: String,
    pub worker_cpu_affinity: String,
    pub worker_shutdown_timeout: String,
    pub worker_connections: String,
    pub worker_rlimit_nofile: String,
    pub resolver_addresses: Vec<String>,
    pub resolver_ipv6: bool,
    pub resolver_valid: String,
    pub resolver_timeout: String,
    pub keepalive_timeout: String,
    pub keepalive_requests: i64,
    pub variables_hash_bucket_size: u64,
    pub variables_hash_max_size: u64,
}

// ============================================================================
// VirtualServer (v2) model
// ============================================================================

/// Full config for one VirtualServer and the routes merged into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualServerConfig {
    pub server: VsServer,
    pub upstreams: Vec<Upstream>,
    pub split_clients: Vec<SplitClient>,
    pub maps: Vec<Map>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VsServer {
    pub server_name: String,
    pub proxy_protocol: bool,
    pub ssl: Option<VsSsl>,
    pub redirect_to_https_based_on_x_forwarded_proto: bool,
    pub server_tokens: String,
    pub real_ip_header: String,
    pub set_real_ip_from: Vec<String>,
    pub real_ip_recursive: bool,
    pub snippets: Vec<String>,
    pub internal_redirect_locations: Vec<InternalRedirectLocation>,
    pub locations: Vec<VsLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VsSsl {
    pub http2: bool,
    pub binding: SslBinding,
    pub redirect_to_https: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VsLocation {
    pub path: String,
    pub snippets: Vec<String>,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub proxy_send_timeout: String,
    pub client_max_body_size: String,
    pub proxy_max_temp_file_size: String,
    pub proxy_buffering: bool,
    pub proxy_buffers: String,
    pub proxy_buffer_size: String,
    pub proxy_pass: String,
    pub has_keepalive: bool,
    /// Set when the location came from a VirtualServerRoute subroute
    pub route: Option<ResourceMeta>,
}

/// `split_clients` block distributing requests across named locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SplitClient {
    pub source: String,
    pub variable: String,
    pub distributions: Vec<Distribution>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Distribution {
    pub weight: String,
    pub value: String,
}

/// `map` block from a source variable to a result variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Map {
    pub source: String,
    pub variable: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Parameter {
    pub value: String,
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InternalRedirectLocation {
    pub path: String,
    pub destination: String,
}

// ============================================================================
// Naming
// ============================================================================

/// Upstream name for an Ingress backend.
///
/// Unique per (ingress, host, backend). The default backend uses an empty host.
pub fn ingress_upstream_name(
    namespace: &str,
    name: &str,
    host: &str,
    service: &str,
    port: &str,
) -> String {
    format!("{}-{}-{}-{}-{}", namespace, name, host, service, port)
}

/// Config artifact name for an Ingress (simple or master).
pub fn ingress_config_name(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

/// Config artifact name for a VirtualServer.
pub fn virtual_server_config_name(namespace: &str, name: &str) -> String {
    format!("vs_{}_{}", namespace, name)
}

/// Named location that redirects to the JWT login URL.
pub fn jwt_redirect_location_name(namespace: &str, name: &str) -> String {
    format!("@login_url_{}-{}", namespace, name)
}

/// Key of the endpoint map used by VirtualServer assembly.
pub fn endpoints_key(namespace: &str, service: &str, port: u16) -> String {
    format!("{}/{}:{}", namespace, service, port)
}

/// Upstream namer for VirtualServers and their routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamNamer {
    prefix: String,
}

impl UpstreamNamer {
    pub fn for_virtual_server(namespace: &str, name: &str) -> Self {
        UpstreamNamer {
            prefix: format!("vs_{}_{}", namespace, name),
        }
    }

    pub fn for_virtual_server_route(
        vs_namespace: &str,
        vs_name: &str,
        vsr_namespace: &str,
        vsr_name: &str,
    ) -> Self {
        UpstreamNamer {
            prefix: format!(
                "vs_{}_{}_vsr_{}_{}",
                vs_namespace, vs_name, vsr_namespace, vsr_name
            ),
        }
    }

    pub fn upstream(&self, upstream: &str) -> String {
        format!("{}_{}", self.prefix, upstream)
    }
}

/// Namer for the variables a VirtualServer declares in split_clients and maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableNamer {
    safe_ns_name: String,
}

impl VariableNamer {
    pub fn new(namespace: &str, name: &str) -> Self {
        VariableNamer {
            safe_ns_name: format!("{}_{}", namespace, name).replace('-', "_"),
        }
    }

    pub fn split_client_variable(&self, index: usize) -> String {
        format!("$vs_{}_splits_{}", self.safe_ns_name, index)
    }

    pub fn rules_map_variable(&self, rules: usize, matched: usize, condition: usize) -> String {
        format!(
            "$vs_{}_rules_{}_match_{}_cond_{}",
            self.safe_ns_name, rules, matched, condition
        )
    }

    pub fn rules_main_map_variable(&self, rules: usize) -> String {
        format!("$vs_{}_rules_{}", self.safe_ns_name, rules)
    }
}

impl fmt::Display for UpstreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
