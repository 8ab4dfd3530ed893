//! Global configuration parameters
//!
//! `ConfigParams` carries the defaults every site starts from. The override
//! ConfigMap replaces them globally, per-fragment annotations replace them
//! for one site (see `annotations`). `StaticConfigParams` are fixed at startup.

use common::MainConfig;
use k8s_openapi::api::core::v1::ConfigMap;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{error, warn};

use super::cache::ResourceKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{context} '{key}' contains invalid {expected}: {value:?}, ignoring")]
    InvalidValue {
        context: String,
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("{context} '{key}' must be greater than 0, ignoring")]
    MustBePositive { context: String, key: String },

    #[error("Invalid load balancing method: {0:?}")]
    InvalidLbMethod(String),

    #[error("Invalid time string: {0:?}")]
    InvalidTime(String),
}

/// Parameters shared by the main config and every site config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigParams {
    pub location_snippets: Vec<String>,
    pub server_snippets: Vec<String>,
    pub server_tokens: String,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub proxy_send_timeout: String,
    pub client_max_body_size: String,
    pub http2: bool,
    pub redirect_to_https: bool,
    pub ssl_redirect: bool,
    pub main_snippets: Vec<String>,
    pub http_snippets: Vec<String>,
    pub server_names_hash_bucket_size: String,
    pub server_names_hash_max_size: String,
    pub access_log_off: bool,
    pub log_format: String,
    pub error_log_level: String,
    pub proxy_buffering: bool,
    pub proxy_buffers: String,
    pub proxy_buffer_size: String,
    pub proxy_max_temp_file_size: String,
    pub proxy_protocol: bool,
    pub proxy_hide_headers: Vec<String>,
    pub proxy_pass_headers: Vec<String>,
    pub hsts: bool,
    pub hsts_behind_proxy: bool,
    pub hsts_max_age: i64,
    pub hsts_include_subdomains: bool,
    pub lb_method: String,
    pub worker_processes: String,
    pub worker_cpu_affinity: String,
    pub worker_shutdown_timeout: String,
    pub worker_connections: String,
    pub worker_rlimit_nofile: String,
    pub keepalive: i64,
    pub max_fails: i64,
    pub max_conns: i64,
    pub fail_timeout: String,
    pub health_check_enabled: bool,
    pub health_check_mandatory: bool,
    pub health_check_mandatory_queue: i64,
    pub slow_start: String,
    pub resolver_addresses: Vec<String>,
    pub resolver_ipv6: bool,
    pub resolver_valid: String,
    pub resolver_timeout: String,
    pub keepalive_timeout: String,
    pub keepalive_requests: i64,
    pub variables_hash_bucket_size: u64,
    pub variables_hash_max_size: u64,

    pub real_ip_header: String,
    pub set_real_ip_from: Vec<String>,
    pub real_ip_recursive: bool,

    pub ssl_protocols: String,
    pub ssl_prefer_server_ciphers: bool,
    pub ssl_ciphers: String,

    pub main_template: Option<String>,
    pub ingress_template: Option<String>,

    pub jwt_realm: String,
    pub jwt_key: String,
    pub jwt_token: String,
    pub jwt_login_url: String,

    pub ports: Vec<u16>,
    pub ssl_ports: Vec<u16>,
}

impl Default for ConfigParams {
    fn default() -> Self {
        Self {
            location_snippets: Vec::new(),
            server_snippets: Vec::new(),
            server_tokens: "on".to_string(),
            proxy_connect_timeout: "60s".to_string(),
            proxy_read_timeout: "60s".to_string(),
            proxy_send_timeout: "60s".to_string(),
            client_max_body_size: "1m".to_string(),
            http2: false,
            redirect_to_https: false,
            ssl_redirect: true,
            main_snippets: Vec::new(),
            http_snippets: Vec::new(),
            server_names_hash_bucket_size: String::new(),
            server_names_hash_max_size: "512".to_string(),
            access_log_off: false,
            log_format: String::new(),
            error_log_level: "notice".to_string(),
            proxy_buffering: true,
            proxy_buffers: String::new(),
            proxy_buffer_size: String::new(),
            proxy_max_temp_file_size: String::new(),
            proxy_protocol: false,
            proxy_hide_headers: Vec::new(),
            proxy_pass_headers: Vec::new(),
            hsts: false,
            hsts_behind_proxy: false,
            hsts_max_age: 2_592_000,
            hsts_include_subdomains: false,
            lb_method: "random two least_conn".to_string(),
            worker_processes: "auto".to_string(),
            worker_cpu_affinity: String::new(),
            worker_shutdown_timeout: String::new(),
            worker_connections: "1024".to_string(),
            worker_rlimit_nofile: String::new(),
            keepalive: 0,
            max_fails: 1,
            max_conns: 0,
            fail_timeout: "10s".to_string(),
            health_check_enabled: false,
            health_check_mandatory: false,
            health_check_mandatory_queue: 0,
            slow_start: String::new(),
            resolver_addresses: Vec::new(),
            resolver_ipv6: true,
            resolver_valid: String::new(),
            resolver_timeout: String::new(),
            keepalive_timeout: "65s".to_string(),
            keepalive_requests: 100,
            variables_hash_bucket_size: 256,
            variables_hash_max_size: 1024,
            real_ip_header: String::new(),
            set_real_ip_from: Vec::new(),
            real_ip_recursive: false,
            ssl_protocols: String::new(),
            ssl_prefer_server_ciphers: false,
            ssl_ciphers: String::new(),
            main_template: None,
            ingress_template: None,
            jwt_realm: String::new(),
            jwt_key: String::new(),
            jwt_token: String::new(),
            jwt_login_url: String::new(),
            ports: vec![80],
            ssl_ports: vec![443],
        }
    }
}

/// Parameters fixed for the lifetime of the process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticConfigParams {
    pub health_status: bool,
    pub nginx_status: bool,
    pub nginx_status_allow_cidrs: Vec<String>,
    pub nginx_status_port: u16,
}

// ============================================================================
// Typed key lookup
// ============================================================================

/// Typed reads from a string map (ConfigMap data or annotations).
///
/// Every getter returns `None` when the key is absent and `Some(Err)` when it
/// is present but malformed, so callers can keep the default and log.
pub(crate) struct KeyReader<'a> {
    data: &'a BTreeMap<String, String>,
    context: String,
}

impl<'a> KeyReader<'a> {
    pub(crate) fn new(data: &'a BTreeMap<String, String>, kind: &str, key: &ResourceKey) -> Self {
        Self {
            data,
            context: format!("{} {}", kind, key),
        }
    }

    pub(crate) fn context(&self) -> &str {
        &self.context
    }

    pub(crate) fn string(&self, key: &str) -> Option<&'a str> {
        self.data.get(key).map(String::as_str)
    }

    pub(crate) fn bool(&self, key: &str) -> Option<Result<bool, ParseError>> {
        let value = self.string(key)?;
        Some(parse_bool(value).ok_or_else(|| self.invalid(key, value, "bool")))
    }

    pub(crate) fn int(&self, key: &str) -> Option<Result<i64, ParseError>> {
        let value = self.string(key)?;
        Some(
            value
                .parse::<i64>()
                .map_err(|_| self.invalid(key, value, "integer")),
        )
    }

    pub(crate) fn uint(&self, key: &str, non_zero: bool) -> Option<Result<u64, ParseError>> {
        let value = self.string(key)?;
        Some(match value.parse::<u64>() {
            Err(_) => Err(self.invalid(key, value, "uint64")),
            Ok(0) if non_zero => Err(ParseError::MustBePositive {
                context: self.context.clone(),
                key: key.to_string(),
            }),
            Ok(parsed) => Ok(parsed),
        })
    }

    pub(crate) fn port(&self, key: &str) -> Option<Result<u16, ParseError>> {
        let value = self.string(key)?;
        Some(match value.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(self.invalid(key, value, "port")),
        })
    }

    pub(crate) fn string_list(&self, key: &str, delimiter: &str) -> Option<Vec<String>> {
        let value = self.string(key)?;
        Some(value.split(delimiter).map(str::to_string).collect())
    }

    fn invalid(&self, key: &str, value: &str, expected: &'static str) -> ParseError {
        ParseError::InvalidValue {
            context: self.context.clone(),
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }
}

/// Same literals the cluster tooling accepts for booleans
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a list of ports, all of which must be valid
pub(crate) fn parse_ports(values: &[String]) -> Option<Vec<u16>> {
    values
        .iter()
        .map(|v| v.trim().parse::<u16>().ok().filter(|p| *p > 0))
        .collect()
}

// ============================================================================
// Value grammars
// ============================================================================

const LB_METHODS: &[&str] = &[
    "least_conn",
    "ip_hash",
    "random",
    "random two",
    "random two least_conn",
];

const PLUS_LB_METHODS: &[&str] = &[
    "random two least_time=header",
    "random two least_time=last_byte",
    "least_time header",
    "least_time last_byte",
    "least_time header inflight",
    "least_time last_byte inflight",
];

/// Map a load-balancing method to the proxy's directive.
///
/// `round_robin` is the proxy default and maps to an empty string.
pub fn parse_lb_method(method: &str, nginx_plus: bool) -> Result<String, ParseError> {
    let method = method.trim();

    if method == "round_robin" {
        return Ok(String::new());
    }

    if method.starts_with("hash") {
        return validate_hash_lb_method(method);
    }

    if LB_METHODS.contains(&method) || (nginx_plus && PLUS_LB_METHODS.contains(&method)) {
        return Ok(method.to_string());
    }

    Err(ParseError::InvalidLbMethod(method.to_string()))
}

fn validate_hash_lb_method(method: &str) -> Result<String, ParseError> {
    let words: Vec<&str> = method.split(' ').collect();
    match words.as_slice() {
        ["hash", _] | ["hash", _, "consistent"] => Ok(method.to_string()),
        _ => Err(ParseError::InvalidLbMethod(method.to_string())),
    }
}

fn time_grammar() -> &'static Regex {
    static TIME: OnceLock<Regex> = OnceLock::new();
    TIME.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^([0-9]+([ms|s|m|h|d|w|M|y]?){0,1} *)+$").expect("time grammar is valid")
    })
}

/// Validate a time value against the proxy's time grammar (`1m 30s`, `500ms`)
pub fn parse_time(value: &str) -> Result<String, ParseError> {
    let value = value.trim();
    if time_grammar().is_match(value) {
        Ok(value.to_string())
    } else {
        Err(ParseError::InvalidTime(value.to_string()))
    }
}

// ============================================================================
// ConfigMap
// ============================================================================

macro_rules! set_parsed {
    ($target:expr, $parsed:expr) => {
        match $parsed {
            Some(Ok(value)) => $target = value,
            Some(Err(err)) => error!("{}", err),
            None => {}
        }
    };
}

impl ConfigParams {
    /// Parse the override ConfigMap on top of the defaults.
    ///
    /// Malformed keys are logged and keep their default value.
    pub fn from_config_map(cm: &ConfigMap, nginx_plus: bool) -> Self {
        let empty = BTreeMap::new();
        let data = cm.data.as_ref().unwrap_or(&empty);
        let key = ResourceKey::of(cm);
        let reader = KeyReader::new(data, "ConfigMap", &key);
        let mut params = ConfigParams::default();

        match reader.bool("server-tokens") {
            Some(Ok(on)) => params.server_tokens = if on { "on" } else { "off" }.to_string(),
            Some(Err(err)) => {
                if nginx_plus {
                    // Plus accepts a custom server header value
                    params.server_tokens =
                        reader.string("server-tokens").unwrap_or_default().to_string();
                } else {
                    error!("{}", err);
                }
            }
            None => {}
        }

        if let Some(method) = reader.string("lb-method") {
            match parse_lb_method(method, nginx_plus) {
                Ok(parsed) => params.lb_method = parsed,
                Err(err) => error!(
                    "{}: Invalid value for the lb-method key: got {:?}: {}",
                    reader.context(),
                    method,
                    err
                ),
            }
        }

        if let Some(v) = reader.string("proxy-connect-timeout") {
            params.proxy_connect_timeout = v.to_string();
        }
        if let Some(v) = reader.string("proxy-read-timeout") {
            params.proxy_read_timeout = v.to_string();
        }
        if let Some(v) = reader.string("proxy-send-timeout") {
            params.proxy_send_timeout = v.to_string();
        }
        if let Some(v) = reader.string_list("proxy-hide-headers", ",") {
            params.proxy_hide_headers = v;
        }
        if let Some(v) = reader.string_list("proxy-pass-headers", ",") {
            params.proxy_pass_headers = v;
        }
        if let Some(v) = reader.string("client-max-body-size") {
            params.client_max_body_size = v.to_string();
        }
        if let Some(v) = reader.string("server-names-hash-bucket-size") {
            params.server_names_hash_bucket_size = v.to_string();
        }
        if let Some(v) = reader.string("server-names-hash-max-size") {
            params.server_names_hash_max_size = v.to_string();
        }

        set_parsed!(params.http2, reader.bool("http2"));
        set_parsed!(params.redirect_to_https, reader.bool("redirect-to-https"));
        set_parsed!(params.ssl_redirect, reader.bool("ssl-redirect"));

        apply_hsts(&reader, &mut params);

        set_parsed!(params.proxy_protocol, reader.bool("proxy-protocol"));

        if let Some(v) = reader.string("real-ip-header") {
            params.real_ip_header = v.to_string();
        }
        if let Some(v) = reader.string_list("set-real-ip-from", ",") {
            params.set_real_ip_from = v;
        }
        set_parsed!(params.real_ip_recursive, reader.bool("real-ip-recursive"));

        if let Some(v) = reader.string("ssl-protocols") {
            params.ssl_protocols = v.to_string();
        }
        set_parsed!(
            params.ssl_prefer_server_ciphers,
            reader.bool("ssl-prefer-server-ciphers")
        );
        if let Some(v) = reader.string("ssl-ciphers") {
            params.ssl_ciphers = v.trim_matches('\n').to_string();
        }
        if let Some(v) = reader.string("error-log-level") {
            params.error_log_level = v.to_string();
        }
        set_parsed!(params.access_log_off, reader.bool("access-log-off"));
        if let Some(v) = reader.string("log-format") {
            params.log_format = v.to_string();
        }

        set_parsed!(params.proxy_buffering, reader.bool("proxy-buffering"));
        if let Some(v) = reader.string("proxy-buffers") {
            params.proxy_buffers = v.to_string();
        }
        if let Some(v) = reader.string("proxy-buffer-size") {
            params.proxy_buffer_size = v.to_string();
        }
        if let Some(v) = reader.string("proxy-max-temp-file-size") {
            params.proxy_max_temp_file_size = v.to_string();
        }

        if let Some(v) = reader.string_list("main-snippets", "\n") {
            params.main_snippets = v;
        }
        if let Some(v) = reader.string_list("http-snippets", "\n") {
            params.http_snippets = v;
        }
        if let Some(v) = reader.string_list("location-snippets", "\n") {
            params.location_snippets = v;
        }
        if let Some(v) = reader.string_list("server-snippets", "\n") {
            params.server_snippets = v;
        }

        if let Some(v) = reader.string("worker-processes") {
            if v == "auto" || v.parse::<i64>().is_ok() {
                params.worker_processes = v.to_string();
            } else {
                error!(
                    "{}: Invalid value for worker-processes key: must be an integer or the string 'auto', got {:?}",
                    reader.context(),
                    v
                );
            }
        }
        if let Some(v) = reader.string("worker-cpu-affinity") {
            params.worker_cpu_affinity = v.to_string();
        }
        if let Some(v) = reader.string("worker-shutdown-timeout") {
            params.worker_shutdown_timeout = v.to_string();
        }
        if let Some(v) = reader.string("worker-connections") {
            params.worker_connections = v.to_string();
        }
        if let Some(v) = reader.string("worker-rlimit-nofile") {
            params.worker_rlimit_nofile = v.to_string();
        }

        set_parsed!(params.keepalive, reader.int("keepalive"));
        set_parsed!(params.max_fails, reader.int("max-fails"));
        if let Some(v) = reader.string("fail-timeout") {
            params.fail_timeout = v.to_string();
        }

        if let Some(v) = reader.string("main-template") {
            params.main_template = Some(v.to_string());
        }
        if let Some(v) = reader.string("ingress-template") {
            params.ingress_template = Some(v.to_string());
        }

        apply_resolver(&reader, &mut params, nginx_plus);

        if let Some(v) = reader.string("keepalive-timeout") {
            params.keepalive_timeout = v.to_string();
        }
        set_parsed!(params.keepalive_requests, reader.int("keepalive-requests"));
        set_parsed!(
            params.variables_hash_bucket_size,
            reader.uint("variables-hash-bucket-size", true)
        );
        set_parsed!(
            params.variables_hash_max_size,
            reader.uint("variables-hash-max-size", false)
        );

        params
    }
}

/// HSTS keys are applied together or not at all
fn apply_hsts(reader: &KeyReader<'_>, params: &mut ConfigParams) {
    let hsts = match reader.bool("hsts") {
        Some(Ok(hsts)) => hsts,
        Some(Err(err)) => {
            error!("{}", err);
            return;
        }
        None => return,
    };

    let max_age = reader.int("hsts-max-age");
    let include_subdomains = reader.bool("hsts-include-subdomains");
    let behind_proxy = reader.bool("hsts-behind-proxy");

    let mut parsing_errors = false;
    for err in [
        max_age.as_ref().and_then(|r| r.as_ref().err()),
        include_subdomains.as_ref().and_then(|r| r.as_ref().err()),
        behind_proxy.as_ref().and_then(|r| r.as_ref().err()),
    ]
    .into_iter()
    .flatten()
    {
        error!("{}", err);
        parsing_errors = true;
    }

    if parsing_errors {
        error!(
            "{}: There are configuration issues with hsts annotations, skipping options for all hsts settings",
            reader.context()
        );
        return;
    }

    params.hsts = hsts;
    if let Some(Ok(v)) = max_age {
        params.hsts_max_age = v;
    }
    if let Some(Ok(v)) = include_subdomains {
        params.hsts_include_subdomains = v;
    }
    if let Some(Ok(v)) = behind_proxy {
        params.hsts_behind_proxy = v;
    }
}

fn apply_resolver(reader: &KeyReader<'_>, params: &mut ConfigParams, nginx_plus: bool) {
    if let Some(v) = reader.string_list("resolver-addresses", ",") {
        if nginx_plus {
            params.resolver_addresses = v;
        } else {
            warn!("ConfigMap key 'resolver-addresses' requires NGINX Plus");
        }
    }
    match reader.bool("resolver-ipv6") {
        Some(Ok(v)) if nginx_plus => params.resolver_ipv6 = v,
        Some(Ok(_)) => warn!("ConfigMap key 'resolver-ipv6' requires NGINX Plus"),
        Some(Err(err)) => error!("{}", err),
        None => {}
    }
    if let Some(v) = reader.string("resolver-valid") {
        if nginx_plus {
            params.resolver_valid = v.to_string();
        } else {
            warn!("ConfigMap key 'resolver-valid' requires NGINX Plus");
        }
    }
    if let Some(v) = reader.string("resolver-timeout") {
        if nginx_plus {
            params.resolver_timeout = v.to_string();
        } else {
            warn!("ConfigMap key 'resolver-timeout' requires NGINX Plus");
        }
    }
}

/// Build the http-level config from the static and current parameters
pub fn generate_main_config(static_params: &StaticConfigParams, params: &ConfigParams) -> MainConfig {
    MainConfig {
        server_names_hash_bucket_size: params.server_names_hash_bucket_size.clone(),
        server_names_hash_max_size: params.server_names_hash_max_size.clone(),
        access_log_off: params.access_log_off,
        log_format: params.log_format.clone(),
        error_log_level: params.error_log_level.clone(),
        health_status: static_params.health_status,
        nginx_status: static_params.nginx_status,
        nginx_status_allow_cidrs: static_params.nginx_status_allow_cidrs.clone(),
        nginx_status_port: static_params.nginx_status_port,
        main_snippets: params.main_snippets.clone(),
        http_snippets: params.http_snippets.clone(),
        ssl_protocols: params.ssl_protocols.clone(),
        ssl_prefer_server_ciphers: params.ssl_prefer_server_ciphers,
        ssl_ciphers: params.ssl_ciphers.clone(),
        http2: params.http2,
        server_tokens: params.server_tokens.clone(),
        proxy_protocol: params.proxy_protocol,
        worker_processes: params.worker_processes.clone(),
        worker_cpu_affinity: params.worker_cpu_affinity.clone(),
        worker_shutdown_timeout: params.worker_shutdown_timeout.clone(),
        worker_connections: params.worker_connections.clone(),
        worker_rlimit_nofile: params.worker_rlimit_nofile.clone(),
        resolver_addresses: params.resolver_addresses.clone(),
        resolver_ipv6: params.resolver_ipv6,
        resolver_valid: params.resolver_valid.clone(),
        resolver_timeout: params.resolver_timeout.clone(),
        keepalive_timeout: params.keepalive_timeout.clone(),
        keepalive_requests: params.keepalive_requests,
        variables_hash_bucket_size: params.variables_hash_bucket_size,
        variables_hash_max_size: params.variables_hash_max_size,
    }
}
