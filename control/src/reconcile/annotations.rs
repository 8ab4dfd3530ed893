//! Per-fragment annotation overrides
//!
//! Annotations override the global `ConfigParams` for one site. Composite
//! sites restrict which annotations a root and its leaves may carry, and
//! which root annotations a leaf inherits.

use k8s_openapi::api::networking::v1::Ingress;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{error, warn};

use super::cache::ResourceKey;
use super::params::{parse_lb_method, parse_time, ConfigParams, KeyReader};

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub const MERGEABLE_INGRESS_TYPE_ANNOTATION: &str = "nginx.org/mergeable-ingress-type";
pub const JWT_KEY_ANNOTATION: &str = "nginx.com/jwt-key";
pub const HEALTH_CHECKS_ANNOTATION: &str = "nginx.com/health-checks";

/// Annotations a composite root may not carry (they are path-scoped)
const MASTER_BLOCK_LIST: &[&str] = &[
    "nginx.org/rewrites",
    "nginx.org/ssl-services",
    "nginx.org/grpc-services",
    "nginx.org/websocket-services",
    "nginx.com/sticky-cookie-services",
    "nginx.com/health-checks",
    "nginx.com/health-checks-mandatory",
    "nginx.com/health-checks-mandatory-queue",
];

/// Annotations a composite leaf may not carry (they are server-scoped)
const MINION_BLOCK_LIST: &[&str] = &[
    "nginx.org/proxy-hide-headers",
    "nginx.org/proxy-pass-headers",
    "nginx.org/redirect-to-https",
    "ingress.kubernetes.io/ssl-redirect",
    "nginx.org/hsts",
    "nginx.org/hsts-max-age",
    "nginx.org/hsts-include-subdomains",
    "nginx.org/server-tokens",
    "nginx.org/listen-ports",
    "nginx.org/listen-ports-ssl",
    "nginx.org/server-snippets",
];

/// Root annotations a leaf inherits when it does not set them itself
const MINION_INHERITANCE_LIST: &[&str] = &[
    "nginx.org/proxy-connect-timeout",
    "nginx.org/proxy-read-timeout",
    "nginx.org/proxy-send-timeout",
    "nginx.org/client-max-body-size",
    "nginx.org/proxy-buffering",
    "nginx.org/proxy-buffers",
    "nginx.org/proxy-buffer-size",
    "nginx.org/proxy-max-temp-file-size",
    "nginx.org/location-snippets",
    "nginx.org/lb-method",
    "nginx.org/keepalive",
    "nginx.org/max-fails",
    "nginx.org/max-conns",
    "nginx.org/fail-timeout",
];

fn annotation<'a>(ing: &'a Ingress, key: &str) -> Option<&'a str> {
    ing.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn is_master(ing: &Ingress) -> bool {
    annotation(ing, MERGEABLE_INGRESS_TYPE_ANNOTATION) == Some("master")
}

pub fn is_minion(ing: &Ingress) -> bool {
    annotation(ing, MERGEABLE_INGRESS_TYPE_ANNOTATION) == Some("minion")
}

/// True if the Ingress belongs to this controller.
///
/// The class annotation wins over `spec.ingressClassName`. Without either,
/// the Ingress is ours unless only explicitly classed Ingresses are handled.
pub fn has_ingress_class(ing: &Ingress, ingress_class: &str, use_ingress_class_only: bool) -> bool {
    if let Some(class) = annotation(ing, INGRESS_CLASS_ANNOTATION) {
        return class == ingress_class;
    }
    match ing
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
    {
        Some(class) => class == ingress_class,
        None => !use_ingress_class_only,
    }
}

/// Health checks are requested through an annotation and need Plus
pub fn health_checks_requested(annotations: &BTreeMap<String, String>, nginx_plus: bool) -> bool {
    nginx_plus && annotations.get(HEALTH_CHECKS_ANNOTATION).map(String::as_str) == Some("true")
}

/// Apply annotation overrides on top of `base`.
///
/// Malformed values are logged and ignored, the base value is kept.
pub fn parse_annotations(
    annotations: &BTreeMap<String, String>,
    key: &ResourceKey,
    base: &ConfigParams,
    nginx_plus: bool,
) -> ConfigParams {
    let reader = KeyReader::new(annotations, "Ingress", key);
    let mut params = base.clone();

    if let Some(method) = reader.string("nginx.org/lb-method") {
        match parse_lb_method(method, nginx_plus) {
            Ok(parsed) => params.lb_method = parsed,
            Err(err) => error!(
                "{}: Invalid value for the nginx.org/lb-method: got {:?}: {}",
                reader.context(),
                method,
                err
            ),
        }
    }

    match reader.bool(HEALTH_CHECKS_ANNOTATION) {
        Some(Ok(enabled)) if nginx_plus => params.health_check_enabled = enabled,
        Some(Ok(_)) => warn!("Annotation 'nginx.com/health-checks' requires NGINX Plus"),
        Some(Err(err)) => error!("{}", err),
        None => {}
    }

    if params.health_check_enabled {
        match reader.bool("nginx.com/health-checks-mandatory") {
            Some(Ok(mandatory)) => params.health_check_mandatory = mandatory,
            Some(Err(err)) => error!("{}", err),
            None => {}
        }
    }

    if params.health_check_mandatory {
        match reader.int("nginx.com/health-checks-mandatory-queue") {
            Some(Ok(queue)) => params.health_check_mandatory_queue = queue,
            Some(Err(err)) => error!("{}", err),
            None => {}
        }
    }

    if let Some(slow_start) = reader.string("nginx.com/slow-start") {
        match parse_time(slow_start) {
            Ok(parsed) if nginx_plus => params.slow_start = parsed,
            Ok(_) => warn!("Annotation 'nginx.com/slow-start' requires NGINX Plus"),
            Err(err) => error!(
                "{}: Invalid value nginx.com/slow-start: got {:?}: {}",
                reader.context(),
                slow_start,
                err
            ),
        }
    }

    match reader.bool("nginx.org/server-tokens") {
        Some(Ok(on)) => params.server_tokens = if on { "on" } else { "off" }.to_string(),
        Some(Err(err)) => {
            if nginx_plus {
                params.server_tokens = reader
                    .string("nginx.org/server-tokens")
                    .unwrap_or_default()
                    .to_string();
            } else {
                error!("{}", err);
            }
        }
        None => {}
    }

    if let Some(v) = reader.string_list("nginx.org/server-snippets", "\n") {
        params.server_snippets = v;
    }
    if let Some(v) = reader.string_list("nginx.org/location-snippets", "\n") {
        params.location_snippets = v;
    }
    if let Some(v) = reader.string("nginx.org/proxy-connect-timeout") {
        params.proxy_connect_timeout = v.to_string();
    }
    if let Some(v) = reader.string("nginx.org/proxy-read-timeout") {
        params.proxy_read_timeout = v.to_string();
    }
    if let Some(v) = reader.string("nginx.org/proxy-send-timeout") {
        params.proxy_send_timeout = v.to_string();
    }
    if let Some(v) = reader.string_list("nginx.org/proxy-hide-headers", ",") {
        params.proxy_hide_headers = v;
    }
    if let Some(v) = reader.string_list("nginx.org/proxy-pass-headers", ",") {
        params.proxy_pass_headers = v;
    }
    if let Some(v) = reader.string("nginx.org/client-max-body-size") {
        params.client_max_body_size = v.to_string();
    }

    for (target, key) in [
        (&mut params.redirect_to_https, "nginx.org/redirect-to-https"),
        (&mut params.ssl_redirect, "ingress.kubernetes.io/ssl-redirect"),
        (&mut params.proxy_buffering, "nginx.org/proxy-buffering"),
    ] {
        match reader.bool(key) {
            Some(Ok(v)) => *target = v,
            Some(Err(err)) => error!("{}", err),
            None => {}
        }
    }

    apply_hsts(&reader, &mut params);

    if let Some(v) = reader.string("nginx.org/proxy-buffers") {
        params.proxy_buffers = v.to_string();
    }
    if let Some(v) = reader.string("nginx.org/proxy-buffer-size") {
        params.proxy_buffer_size = v.to_string();
    }
    if let Some(v) = reader.string("nginx.org/proxy-max-temp-file-size") {
        params.proxy_max_temp_file_size = v.to_string();
    }

    if nginx_plus {
        if let Some(v) = reader.string("nginx.com/jwt-realm") {
            params.jwt_realm = v.to_string();
        }
        if let Some(v) = reader.string(JWT_KEY_ANNOTATION) {
            params.jwt_key = format!("{}/{}", key.namespace, v);
        }
        if let Some(v) = reader.string("nginx.com/jwt-token") {
            params.jwt_token = v.to_string();
        }
        if let Some(v) = reader.string("nginx.com/jwt-login-url") {
            params.jwt_login_url = v.to_string();
        }
    }

    let ports = listen_ports(&reader, "nginx.org/listen-ports");
    if !ports.is_empty() {
        params.ports = ports;
    }
    let ssl_ports = listen_ports(&reader, "nginx.org/listen-ports-ssl");
    if !ssl_ports.is_empty() {
        params.ssl_ports = ssl_ports;
    }

    for (target, key) in [
        (&mut params.keepalive, "nginx.org/keepalive"),
        (&mut params.max_fails, "nginx.org/max-fails"),
        (&mut params.max_conns, "nginx.org/max-conns"),
    ] {
        match reader.int(key) {
            Some(Ok(v)) => *target = v,
            Some(Err(err)) => error!("{}", err),
            None => {}
        }
    }

    if let Some(v) = reader.string("nginx.org/fail-timeout") {
        params.fail_timeout = v.to_string();
    }

    params
}

fn apply_hsts(reader: &KeyReader<'_>, params: &mut ConfigParams) {
    let hsts = match reader.bool("nginx.org/hsts") {
        Some(Ok(hsts)) => hsts,
        Some(Err(err)) => {
            error!("{}", err);
            return;
        }
        None => return,
    };

    let max_age = reader.int("nginx.org/hsts-max-age").transpose();
    let include_subdomains = reader.bool("nginx.org/hsts-include-subdomains").transpose();
    let behind_proxy = reader.bool("nginx.org/hsts-behind-proxy").transpose();

    match (max_age, include_subdomains, behind_proxy) {
        (Ok(max_age), Ok(include_subdomains), Ok(behind_proxy)) => {
            params.hsts = hsts;
            if let Some(v) = max_age {
                params.hsts_max_age = v;
            }
            if let Some(v) = include_subdomains {
                params.hsts_include_subdomains = v;
            }
            if let Some(v) = behind_proxy {
                params.hsts_behind_proxy = v;
            }
        }
        (max_age, include_subdomains, behind_proxy) => {
            for err in [max_age.err(), include_subdomains.err(), behind_proxy.err()]
                .into_iter()
                .flatten()
            {
                error!("{}", err);
            }
            error!(
                "{}: There are configuration issues with hsts annotations, skipping annotations for all hsts settings",
                reader.context()
            );
        }
    }
}

fn listen_ports(reader: &KeyReader<'_>, key: &str) -> Vec<u16> {
    let Some(values) = reader.string_list(key, ",") else {
        return Vec::new();
    };
    values
        .iter()
        .filter_map(|value| match value.trim().parse::<u16>() {
            Ok(port) if port > 0 => Some(port),
            _ => {
                error!(
                    "{}: {} contains invalid declaration: {:?}, ignoring",
                    reader.context(),
                    key,
                    value
                );
                None
            }
        })
        .collect()
}

// ============================================================================
// Per-service options
// ============================================================================

/// Options keyed by backend service name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    pub websocket: HashSet<String>,
    pub ssl: HashSet<String>,
    pub grpc: HashSet<String>,
    pub rewrites: HashMap<String, String>,
    pub sticky_cookies: HashMap<String, String>,
}

impl ServiceOptions {
    pub fn from_annotations(annotations: &BTreeMap<String, String>, key: &ResourceKey) -> Self {
        let list = |name: &str| -> HashSet<String> {
            annotations
                .get(name)
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default()
        };

        let mut rewrites = HashMap::new();
        if let Some(value) = annotations.get("nginx.org/rewrites") {
            for declaration in value.split(';').filter(|d| !d.trim().is_empty()) {
                match parse_rewrite(declaration) {
                    Some((service, path)) => {
                        rewrites.insert(service, path);
                    }
                    None => error!(
                        "In {} nginx.org/rewrites contains invalid declaration: {:?}, ignoring",
                        key, declaration
                    ),
                }
            }
        }

        let mut sticky_cookies = HashMap::new();
        if let Some(value) = annotations.get("nginx.com/sticky-cookie-services") {
            for declaration in value.split(';').filter(|d| !d.trim().is_empty()) {
                match parse_sticky_service(declaration) {
                    Some((service, cookie)) => {
                        sticky_cookies.insert(service, cookie);
                    }
                    None => error!(
                        "In {} nginx.com/sticky-cookie-services contains invalid declaration: {:?}, ignoring",
                        key, declaration
                    ),
                }
            }
        }

        Self {
            websocket: list("nginx.org/websocket-services"),
            ssl: list("nginx.org/ssl-services"),
            grpc: list("nginx.org/grpc-services"),
            rewrites,
            sticky_cookies,
        }
    }
}

/// `serviceName=tea-svc rewrite=/tea/`
fn parse_rewrite(declaration: &str) -> Option<(String, String)> {
    let (service_part, rewrite_part) = declaration.trim().split_once(' ')?;
    let service = single_value(service_part)?;
    let rewrite = single_value(rewrite_part.trim())?;
    Some((service, rewrite))
}

/// `serviceName=coffee-svc srv_id expires=1h path=/coffee`
fn parse_sticky_service(declaration: &str) -> Option<(String, String)> {
    let (service_part, cookie) = declaration.trim().split_once(' ')?;
    let service = single_value(service_part)?;
    Some((service, cookie.to_string()))
}

fn single_value(pair: &str) -> Option<String> {
    let parts: Vec<&str> = pair.split('=').collect();
    match parts.as_slice() {
        [_, value] => Some(value.to_string()),
        _ => None,
    }
}

// ============================================================================
// Composite filtering
// ============================================================================

fn filter(annotations: &mut BTreeMap<String, String>, block_list: &[&str]) -> Vec<String> {
    let removed: Vec<String> = annotations
        .keys()
        .filter(|k| block_list.contains(&k.as_str()))
        .cloned()
        .collect();
    for key in &removed {
        annotations.remove(key);
    }
    removed
}

/// Drop annotations a composite root may not carry; returns the removed keys
pub fn filter_master_annotations(annotations: &mut BTreeMap<String, String>) -> Vec<String> {
    filter(annotations, MASTER_BLOCK_LIST)
}

/// Drop annotations a composite leaf may not carry; returns the removed keys
pub fn filter_minion_annotations(annotations: &mut BTreeMap<String, String>) -> Vec<String> {
    filter(annotations, MINION_BLOCK_LIST)
}

/// Copy inheritable root annotations the leaf does not define itself
pub fn merge_master_annotations_into_minion(
    minion: &mut BTreeMap<String, String>,
    master: &BTreeMap<String, String>,
) {
    for (key, value) in master {
        if MINION_INHERITANCE_LIST.contains(&key.as_str()) && !minion.contains_key(key) {
            minion.insert(key.clone(), value.clone());
        }
    }
}
