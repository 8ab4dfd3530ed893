//! Config Assembler for Ingress sites
//!
//! Pure mapping from resolved fragments and global parameters to the
//! render-ready `IngressConfig`. Nothing here touches the cache, the
//! filesystem or the proxy.

use common::{
    ingress_upstream_name, jwt_redirect_location_name, HealthCheck, IngressConfig, JwtAuth,
    JwtRedirectLocation, Location, Server, SslBinding, Upstream, UpstreamServer,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{error, warn};

use super::annotations::{
    filter_master_annotations, filter_minion_annotations, merge_master_annotations_into_minion,
    parse_annotations, ServiceOptions,
};
use super::cache::ResourceKey;
use super::fragment::{BackendRef, HealthProbe, ResolvedFragment};
use super::merge::CompositeSite;
use super::params::ConfigParams;

/// Global inputs shared by every site
#[derive(Debug, Clone, Copy)]
pub struct AssemblyContext<'a> {
    pub params: &'a ConfigParams,
    pub nginx_plus: bool,
    pub resolver_configured: bool,
    /// PEM file served when a referenced TLS secret is missing or invalid
    pub missing_secret_pem: &'a str,
}

/// Files written for a site's secrets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretFiles {
    /// PEM file per host; `""` for a TLS entry without hosts
    pub pems: BTreeMap<String, String>,
    /// Empty when the site has no JWK secret
    pub jwt_key_file: String,
}

fn path_or_default(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

fn upstream_name(resolved: &ResolvedFragment, host: &str, backend: &BackendRef) -> String {
    let key = resolved.key();
    ingress_upstream_name(
        &key.namespace,
        &key.name,
        host,
        &backend.service,
        &backend.port.to_string(),
    )
}

fn create_health_check(probe: &HealthProbe, upstream_name: &str, params: &ConfigParams) -> HealthCheck {
    HealthCheck {
        upstream_name: upstream_name.to_string(),
        uri: probe.path.clone(),
        interval: probe.period_seconds,
        fails: probe.failure_threshold,
        passes: probe.success_threshold,
        scheme: probe.scheme.to_lowercase(),
        mandatory: params.health_check_mandatory,
        headers: probe.headers.clone(),
        timeout_seconds: i64::from(probe.timeout_seconds),
    }
}

/// Build the upstream for one backend.
///
/// Without endpoints, OSS keeps the 502 sentinel member while Plus keeps an
/// empty list that is filled later through the incremental API.
fn create_upstream(
    resolved: &ResolvedFragment,
    name: &str,
    backend: &BackendRef,
    options: &ServiceOptions,
    params: &ConfigParams,
    ctx: &AssemblyContext<'_>,
) -> Upstream {
    let mut upstream = if ctx.nginx_plus {
        let (queue, queue_timeout) = match resolved.health_probes.get(backend) {
            Some(probe)
                if params.health_check_enabled
                    && params.health_check_mandatory
                    && params.health_check_mandatory_queue > 0 =>
            {
                (
                    params.health_check_mandatory_queue,
                    i64::from(probe.timeout_seconds),
                )
            }
            _ => (0, 0),
        };
        Upstream {
            name: name.to_string(),
            sticky_cookie: options
                .sticky_cookies
                .get(&backend.service)
                .cloned()
                .unwrap_or_default(),
            queue,
            queue_timeout,
            ..Default::default()
        }
    } else {
        Upstream::with_default_server(name)
    };

    if let Some(endpoints) = resolved.endpoints.get(backend) {
        let external = resolved.external_name_services.contains(&backend.service);
        let endpoints: &[String] = if external && !ctx.resolver_configured {
            warn!(
                "A resolver must be configured for Type ExternalName service {}, no upstream servers will be created",
                backend.service
            );
            &[]
        } else {
            endpoints
        };

        let servers: Vec<UpstreamServer> = endpoints
            .iter()
            .map(|endpoint| UpstreamServer {
                max_fails: params.max_fails,
                max_conns: params.max_conns,
                fail_timeout: params.fail_timeout.clone(),
                slow_start: params.slow_start.clone(),
                resolve: external,
                ..UpstreamServer::from_endpoint(endpoint)
            })
            .collect();
        if !servers.is_empty() {
            upstream.servers = servers;
        }
    }

    upstream.lb_method = params.lb_method.clone();
    upstream
}

fn create_location(
    path: &str,
    upstream: &str,
    backend: &BackendRef,
    options: &ServiceOptions,
    params: &ConfigParams,
) -> Location {
    Location {
        path: path.to_string(),
        upstream: upstream.to_string(),
        location_snippets: params.location_snippets.clone(),
        proxy_connect_timeout: params.proxy_connect_timeout.clone(),
        proxy_read_timeout: params.proxy_read_timeout.clone(),
        proxy_send_timeout: params.proxy_send_timeout.clone(),
        client_max_body_size: params.client_max_body_size.clone(),
        websocket: options.websocket.contains(&backend.service),
        rewrite: options
            .rewrites
            .get(&backend.service)
            .cloned()
            .unwrap_or_default(),
        ssl: options.ssl.contains(&backend.service),
        grpc: options.grpc.contains(&backend.service),
        proxy_buffering: params.proxy_buffering,
        proxy_buffers: params.proxy_buffers.clone(),
        proxy_buffer_size: params.proxy_buffer_size.clone(),
        proxy_max_temp_file_size: params.proxy_max_temp_file_size.clone(),
        jwt_auth: None,
        minion: None,
    }
}

/// Generate the config of one fragment.
///
/// `is_minion` moves JWT validation from the server to each location, since a
/// leaf's locations end up in its root's server.
pub fn generate_ingress_config(
    resolved: &ResolvedFragment,
    files: &SecretFiles,
    is_minion: bool,
    ctx: &AssemblyContext<'_>,
) -> IngressConfig {
    let fragment = &resolved.fragment;
    let params = parse_annotations(&fragment.annotations, &fragment.key, ctx.params, ctx.nginx_plus);
    let mut options = ServiceOptions::from_annotations(&fragment.annotations, &fragment.key);

    if !options.grpc.is_empty() && !params.http2 {
        error!(
            "Ingress {}: annotation nginx.org/grpc-services requires HTTP2, ignoring",
            fragment.key
        );
        options.grpc.clear();
    }

    let jwt_enabled = match &resolved.jwt_key {
        Some(_) if !ctx.nginx_plus => {
            warn!("Ingress {}: JWT validation requires NGINX Plus, ignoring", fragment.key);
            false
        }
        Some(_) => true,
        None => false,
    };
    let jwt_auth = |redirect: String| JwtAuth {
        key: files.jwt_key_file.clone(),
        realm: params.jwt_realm.clone(),
        token: params.jwt_token.clone(),
        redirect_location_name: redirect,
    };
    let redirect_name = || {
        if params.jwt_login_url.is_empty() {
            String::new()
        } else {
            jwt_redirect_location_name(&fragment.key.namespace, &fragment.key.name)
        }
    };

    let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();
    let default_upstream = fragment.default_backend.as_ref().map(|backend| {
        let name = upstream_name(resolved, "", backend);
        let upstream = create_upstream(resolved, &name, backend, &options, &params, ctx);
        upstreams.insert(name.clone(), upstream);
        (name, backend)
    });

    let mut servers = Vec::new();

    for rule in &fragment.rules {
        let Some(paths) = &rule.paths else {
            continue;
        };

        let mut server = Server {
            name: rule.host.clone(),
            server_tokens: params.server_tokens.clone(),
            server_snippets: params.server_snippets.clone(),
            status_zone: rule.host.clone(),
            http2: params.http2,
            redirect_to_https: params.redirect_to_https,
            ssl_redirect: params.ssl_redirect,
            proxy_protocol: params.proxy_protocol,
            hsts: params.hsts,
            hsts_max_age: params.hsts_max_age,
            hsts_include_subdomains: params.hsts_include_subdomains,
            hsts_behind_proxy: params.hsts_behind_proxy,
            proxy_hide_headers: params.proxy_hide_headers.clone(),
            proxy_pass_headers: params.proxy_pass_headers.clone(),
            real_ip_header: params.real_ip_header.clone(),
            set_real_ip_from: params.set_real_ip_from.clone(),
            real_ip_recursive: params.real_ip_recursive,
            ports: params.ports.clone(),
            ssl_ports: params.ssl_ports.clone(),
            ..Default::default()
        };

        if let Some(pem) = files.pems.get(&rule.host) {
            server.ssl = Some(SslBinding::from_pem(pem, ctx.missing_secret_pem));
        }

        if !is_minion && jwt_enabled {
            let auth = jwt_auth(redirect_name());
            if !auth.redirect_location_name.is_empty() {
                server.jwt_redirect_locations.push(JwtRedirectLocation {
                    name: auth.redirect_location_name.clone(),
                    login_url: params.jwt_login_url.clone(),
                });
            }
            server.jwt_auth = Some(auth);
        }

        let mut grpc_only =
            !options.grpc.is_empty() && paths.iter().all(|p| options.grpc.contains(&p.backend.service));
        let mut root_location = false;

        for path in paths {
            let name = upstream_name(resolved, &rule.host, &path.backend);

            if params.health_check_enabled {
                if let Some(probe) = resolved.health_probes.get(&path.backend) {
                    server
                        .health_checks
                        .insert(name.clone(), create_health_check(probe, &name, &params));
                }
            }

            if !upstreams.contains_key(&name) {
                let upstream = create_upstream(resolved, &name, &path.backend, &options, &params, ctx);
                upstreams.insert(name.clone(), upstream);
            }

            let mut location = create_location(
                path_or_default(&path.path),
                &name,
                &path.backend,
                &options,
                &params,
            );
            if is_minion && jwt_enabled {
                let auth = jwt_auth(redirect_name());
                if !auth.redirect_location_name.is_empty() {
                    server.jwt_redirect_locations.push(JwtRedirectLocation {
                        name: auth.redirect_location_name.clone(),
                        login_url: params.jwt_login_url.clone(),
                    });
                }
                location.jwt_auth = Some(auth);
            }

            if location.path == "/" {
                root_location = true;
            }
            server.locations.push(location);
        }

        if let (false, Some((name, backend))) = (root_location, &default_upstream) {
            server
                .locations
                .push(create_location("/", name, backend, &options, &params));

            if params.health_check_enabled {
                if let Some(probe) = resolved.health_probes.get(*backend) {
                    server
                        .health_checks
                        .insert(name.clone(), create_health_check(probe, name, &params));
                }
            }

            if !options.grpc.contains(&backend.service) {
                grpc_only = false;
            }
        }

        server.grpc_only = grpc_only;
        servers.push(server);
    }

    IngressConfig {
        upstreams: upstreams.into_values().collect(),
        servers,
        keepalive: if params.keepalive > 0 {
            params.keepalive.to_string()
        } else {
            String::new()
        },
        ingress: fragment.meta(),
    }
}

/// Members of every upstream of a fragment, keyed by upstream name.
///
/// ExternalName backends are left out, the proxy resolves those itself.
pub fn ingress_upstream_members(resolved: &ResolvedFragment) -> BTreeMap<String, Vec<String>> {
    let fragment = &resolved.fragment;
    let mut members = BTreeMap::new();
    let mut add = |host: &str, backend: &BackendRef| {
        if resolved.external_name_services.contains(&backend.service) {
            return;
        }
        members.insert(
            upstream_name(resolved, host, backend),
            resolved.endpoints.get(backend).cloned().unwrap_or_default(),
        );
    };

    if let Some(backend) = &fragment.default_backend {
        add("", backend);
    }
    for rule in &fragment.rules {
        for path in rule.paths.iter().flatten() {
            add(&rule.host, &path.backend);
        }
    }
    members
}

/// Generate the single-server config of a composite site.
///
/// The root supplies the server, its settings and its upstreams; each leaf
/// supplies locations (attributed to the leaf), health checks, JWT redirect
/// locations and upstreams. Leaves are emitted in site order.
pub fn generate_composite_config(
    site: &CompositeSite,
    master_files: &SecretFiles,
    minion_jwt_files: &HashMap<ResourceKey, String>,
    ctx: &AssemblyContext<'_>,
) -> IngressConfig {
    let mut master = site.master.clone();
    let removed = filter_master_annotations(&mut master.fragment.annotations);
    if !removed.is_empty() {
        error!(
            "Ingress Resource {} with the annotation 'nginx.org/mergeable-ingress-type' set to 'master' cannot contain the '{}' annotation(s). They will be ignored",
            master.fragment.key,
            removed.join(",")
        );
    }

    let master_config = generate_ingress_config(&master, master_files, false, ctx);
    let mut server = master_config.servers.into_iter().next().unwrap_or_default();
    server.locations.clear();
    server.health_checks.clear();

    let mut upstreams = master_config.upstreams;
    let mut locations = Vec::new();
    let mut health_checks = BTreeMap::new();

    for minion in &site.minions {
        let mut minion = minion.clone();
        minion.fragment.default_backend = None;
        merge_master_annotations_into_minion(
            &mut minion.fragment.annotations,
            &site.master.fragment.annotations,
        );
        let removed = filter_minion_annotations(&mut minion.fragment.annotations);
        if !removed.is_empty() {
            error!(
                "Ingress Resource {} with the annotation 'nginx.org/mergeable-ingress-type' set to 'minion' cannot contain the '{}' annotation(s). They will be ignored",
                minion.fragment.key,
                removed.join(",")
            );
        }

        let files = SecretFiles {
            pems: BTreeMap::new(),
            jwt_key_file: minion_jwt_files
                .get(&minion.fragment.key)
                .cloned()
                .unwrap_or_default(),
        };
        let config = generate_ingress_config(&minion, &files, true, ctx);

        for minion_server in config.servers {
            for mut location in minion_server.locations {
                location.minion = Some(config.ingress.clone());
                locations.push(location);
            }
            health_checks.extend(minion_server.health_checks);
            server
                .jwt_redirect_locations
                .extend(minion_server.jwt_redirect_locations);
        }
        upstreams.extend(config.upstreams);
    }

    server.locations = locations;
    server.health_checks = health_checks;

    IngressConfig {
        upstreams,
        servers: vec![server],
        keepalive: master_config.keepalive,
        ingress: master_config.ingress,
    }
}
