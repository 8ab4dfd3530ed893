//! Config Assembler for VirtualServers
//!
//! Maps a merged `VirtualServerSite` to a `VirtualServerConfig`. Route
//! actions translate as follows:
//!
//! ```text
//!  upstream ─► location proxying to the upstream
//!  splits   ─► split_clients on $request_id + one named location per split
//!  rules    ─► one map per (match, condition), chained, plus a main map
//!               selecting a named location per match or the default
//! ```
//!
//! Splits and rules are reached through an internal redirect from the route
//! path to the variable the split_clients/main map sets.

use common::{
    endpoints_key, Distribution, InternalRedirectLocation, Map, Parameter, ResourceMeta,
    SplitClient, SslBinding, Upstream, UpstreamNamer, UpstreamServer, VariableNamer,
    VirtualServerConfig, VsLocation, VsServer, VsSsl, NGINX_502_SERVER,
};
use std::collections::{BTreeMap, HashMap};

use super::assembler::AssemblyContext;
use super::params::ConfigParams;
use super::virtualserver::VirtualServerSite;
use crate::apis::crd::{Condition, Rules, VirtualServerRoute, VsRoute, VsUpstream};

/// Values that are keywords inside a map block
const SPECIAL_MAP_PARAMETERS: [&str; 4] = ["default", "hostnames", "include", "volatile"];

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn lb_method(method: &str, default: &str) -> String {
    match method {
        "" => default.to_string(),
        "round_robin" => String::new(),
        other => other.to_string(),
    }
}

fn generate_upstream(
    name: String,
    upstream: &VsUpstream,
    endpoints: &[String],
    nginx_plus: bool,
    params: &ConfigParams,
) -> Upstream {
    let member = |address: &str| UpstreamServer {
        max_fails: upstream.max_fails.unwrap_or(params.max_fails),
        fail_timeout: or_default(&upstream.fail_timeout, &params.fail_timeout),
        ..UpstreamServer::from_endpoint(address)
    };

    let mut servers: Vec<UpstreamServer> = endpoints.iter().map(|e| member(e)).collect();
    if !nginx_plus && servers.is_empty() {
        servers.push(member(NGINX_502_SERVER));
    }

    Upstream {
        name,
        servers,
        lb_method: lb_method(&upstream.lb_method, &params.lb_method),
        keepalive: upstream.keepalive.unwrap_or(params.keepalive),
        ..Default::default()
    }
}

fn generate_location(
    path: String,
    upstream_name: &str,
    upstream: Option<&VsUpstream>,
    params: &ConfigParams,
    route: Option<&ResourceMeta>,
) -> VsLocation {
    let fallback = VsUpstream::default();
    let upstream = upstream.unwrap_or(&fallback);
    let protocol = if upstream.tls.enable { "https" } else { "http" };
    let has_keepalive = match upstream.keepalive {
        Some(keepalive) => keepalive != 0,
        None => params.keepalive != 0,
    };

    VsLocation {
        path,
        snippets: params.location_snippets.clone(),
        proxy_connect_timeout: or_default(&upstream.connect_timeout, &params.proxy_connect_timeout),
        proxy_read_timeout: or_default(&upstream.read_timeout, &params.proxy_read_timeout),
        proxy_send_timeout: or_default(&upstream.send_timeout, &params.proxy_send_timeout),
        client_max_body_size: params.client_max_body_size.clone(),
        proxy_max_temp_file_size: params.proxy_max_temp_file_size.clone(),
        proxy_buffering: params.proxy_buffering,
        proxy_buffers: params.proxy_buffers.clone(),
        proxy_buffer_size: params.proxy_buffer_size.clone(),
        proxy_pass: format!("{}://{}", protocol, upstream_name),
        has_keepalive,
        route: route.cloned(),
    }
}

/// Named upstreams of one owner (the VirtualServer or one of its routes)
struct Scope<'a> {
    namer: UpstreamNamer,
    upstreams: &'a HashMap<String, &'a VsUpstream>,
    route: Option<ResourceMeta>,
}

impl Scope<'_> {
    fn location(&self, path: String, upstream: &str, params: &ConfigParams) -> VsLocation {
        let name = self.namer.upstream(upstream);
        generate_location(
            path,
            &name,
            self.upstreams.get(&name).copied(),
            params,
            self.route.as_ref(),
        )
    }
}

#[derive(Default)]
struct Generated {
    split_clients: Vec<SplitClient>,
    maps: Vec<Map>,
    locations: Vec<VsLocation>,
    internal_redirects: Vec<InternalRedirectLocation>,
    rules_routes: usize,
}

impl Generated {
    fn add_route(
        &mut self,
        route: &VsRoute,
        scope: &Scope<'_>,
        variables: &VariableNamer,
        params: &ConfigParams,
    ) {
        if !route.splits.is_empty() {
            self.add_splits(route, scope, variables, params);
        } else if let Some(rules) = &route.rules {
            self.add_rules(route, rules, scope, variables, params);
        } else {
            self.locations
                .push(scope.location(route.path.clone(), &route.upstream, params));
        }
    }

    fn add_splits(
        &mut self,
        route: &VsRoute,
        scope: &Scope<'_>,
        variables: &VariableNamer,
        params: &ConfigParams,
    ) {
        let index = self.split_clients.len();
        let variable = variables.split_client_variable(index);

        let mut distributions = Vec::with_capacity(route.splits.len());
        for (i, split) in route.splits.iter().enumerate() {
            let path = format!("@splits_{}_split_{}", index, i);
            distributions.push(Distribution {
                weight: format!("{}%", split.weight),
                value: path.clone(),
            });
            self.locations
                .push(scope.location(path, &split.upstream, params));
        }

        self.split_clients.push(SplitClient {
            source: "$request_id".to_string(),
            variable: variable.clone(),
            distributions,
        });
        self.internal_redirects.push(InternalRedirectLocation {
            path: route.path.clone(),
            destination: variable,
        });
    }

    fn add_rules(
        &mut self,
        route: &VsRoute,
        rules: &Rules,
        scope: &Scope<'_>,
        variables: &VariableNamer,
        params: &ConfigParams,
    ) {
        let index = self.rules_routes;
        self.rules_routes += 1;

        // One map per (match, condition). A hit on condition j yields the
        // variable of condition j+1, the last one yields 1.
        for (i, matched) in rules.matches.iter().enumerate() {
            for (j, condition) in rules.conditions.iter().enumerate() {
                let successful = if j + 1 < matched.values.len() {
                    variables.rules_map_variable(index, i, j + 1)
                } else {
                    "1".to_string()
                };
                let value = matched.values.get(j).map(String::as_str).unwrap_or_default();
                self.maps.push(Map {
                    source: condition_source(condition),
                    variable: variables.rules_map_variable(index, i, j),
                    parameters: map_parameters(value, &successful),
                });
            }
        }

        // The main map concatenates the first variable of each match; the
        // first match with a 1 wins.
        let mut source = String::new();
        let mut parameters = Vec::with_capacity(rules.matches.len() + 1);
        for i in 0..rules.matches.len() {
            source.push_str(&variables.rules_map_variable(index, i, 0));
            parameters.push(Parameter {
                value: format!("~^{}1", "0".repeat(i)),
                result: format!("@rules_{}_match_{}", index, i),
            });
        }
        parameters.push(Parameter {
            value: "default".to_string(),
            result: format!("@rules_{}_default", index),
        });
        let variable = variables.rules_main_map_variable(index);
        self.maps.push(Map {
            source,
            variable: variable.clone(),
            parameters,
        });

        for (i, matched) in rules.matches.iter().enumerate() {
            self.locations.push(scope.location(
                format!("@rules_{}_match_{}", index, i),
                &matched.upstream,
                params,
            ));
        }
        self.locations.push(scope.location(
            format!("@rules_{}_default", index),
            &rules.default_upstream,
            params,
        ));

        self.internal_redirects.push(InternalRedirectLocation {
            path: route.path.clone(),
            destination: variable,
        });
    }
}

fn condition_source(condition: &Condition) -> String {
    if !condition.header.is_empty() {
        format!("$http_{}", condition.header.replace('-', "_"))
    } else if !condition.cookie.is_empty() {
        format!("$cookie_{}", condition.cookie)
    } else if !condition.argument.is_empty() {
        format!("$arg_{}", condition.argument)
    } else {
        condition.variable.clone()
    }
}

/// Quote a match value; a leading `!` negates it
fn map_value(matched: &str) -> (String, bool) {
    if matched.is_empty() {
        return ("\"\"".to_string(), false);
    }
    let (matched, negative) = match matched.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (matched, false),
    };
    if SPECIAL_MAP_PARAMETERS.contains(&matched) {
        return (format!("\\{}", matched), negative);
    }
    (format!("\"{}\"", matched), negative)
}

fn map_parameters(matched: &str, successful: &str) -> Vec<Parameter> {
    let (value, negative) = map_value(matched);
    let (hit, miss) = if negative {
        ("0".to_string(), successful.to_string())
    } else {
        (successful.to_string(), "0".to_string())
    };
    vec![
        Parameter { value, result: hit },
        Parameter {
            value: "default".to_string(),
            result: miss,
        },
    ]
}

fn route_meta(vsr: &VirtualServerRoute) -> ResourceMeta {
    ResourceMeta {
        namespace: vsr.metadata.namespace.clone().unwrap_or_default(),
        name: vsr.metadata.name.clone().unwrap_or_default(),
        annotations: vsr.metadata.annotations.clone().unwrap_or_default(),
    }
}

/// Assemble the config of a VirtualServer site.
///
/// `tls_pem_file` is the PEM written for the VirtualServer's secret; `None`
/// with a secret configured binds the missing-secret PEM and fails closed.
pub fn generate_virtual_server_config(
    site: &VirtualServerSite,
    tls_pem_file: Option<&str>,
    ctx: &AssemblyContext<'_>,
) -> VirtualServerConfig {
    let params = ctx.params;
    let vs = site.virtual_server.as_ref();
    let vs_namespace = site.namespace().to_string();
    let vs_name = vs.metadata.name.clone().unwrap_or_default();

    let ssl = site.tls_secret_name().map(|_| VsSsl {
        http2: params.http2,
        binding: SslBinding::from_pem(
            tls_pem_file.unwrap_or(ctx.missing_secret_pem),
            ctx.missing_secret_pem,
        ),
        redirect_to_https: params.ssl_redirect,
    });

    let vs_namer = UpstreamNamer::for_virtual_server(&vs_namespace, &vs_name);
    let mut upstreams = Vec::new();
    let mut cr_upstreams: HashMap<String, &VsUpstream> = HashMap::new();

    let mut add_upstreams = |namer: &UpstreamNamer, namespace: &str, declared: &[VsUpstream]| {
        for upstream in declared {
            let name = namer.upstream(&upstream.name);
            let key = endpoints_key(namespace, &upstream.service, upstream.port);
            let endpoints = site.endpoints.get(&key).map(Vec::as_slice).unwrap_or_default();
            upstreams.push(generate_upstream(
                name,
                upstream,
                endpoints,
                ctx.nginx_plus,
                params,
            ));
        }
    };
    add_upstreams(&vs_namer, &vs_namespace, &vs.spec.upstreams);

    let route_namers: Vec<UpstreamNamer> = site
        .routes
        .iter()
        .map(|vsr| {
            UpstreamNamer::for_virtual_server_route(
                &vs_namespace,
                &vs_name,
                vsr.metadata.namespace.as_deref().unwrap_or_default(),
                vsr.metadata.name.as_deref().unwrap_or_default(),
            )
        })
        .collect();
    for (vsr, namer) in site.routes.iter().zip(&route_namers) {
        add_upstreams(
            namer,
            vsr.metadata.namespace.as_deref().unwrap_or_default(),
            &vsr.spec.upstreams,
        );
    }

    for upstream in &vs.spec.upstreams {
        cr_upstreams.insert(vs_namer.upstream(&upstream.name), upstream);
    }
    for (vsr, namer) in site.routes.iter().zip(&route_namers) {
        for upstream in &vsr.spec.upstreams {
            cr_upstreams.insert(namer.upstream(&upstream.name), upstream);
        }
    }

    let variables = VariableNamer::new(&vs_namespace, &vs_name);
    let mut generated = Generated::default();

    let vs_scope = Scope {
        namer: vs_namer.clone(),
        upstreams: &cr_upstreams,
        route: None,
    };
    for route in vs.spec.routes.iter().filter(|r| r.route.is_empty()) {
        generated.add_route(route, &vs_scope, &variables, params);
    }

    for (vsr, namer) in site.routes.iter().zip(route_namers) {
        let scope = Scope {
            namer,
            upstreams: &cr_upstreams,
            route: Some(route_meta(vsr)),
        };
        for subroute in &vsr.spec.subroutes {
            generated.add_route(subroute, &scope, &variables, params);
        }
    }

    VirtualServerConfig {
        server: VsServer {
            server_name: vs.spec.host.clone(),
            proxy_protocol: params.proxy_protocol,
            ssl,
            redirect_to_https_based_on_x_forwarded_proto: params.redirect_to_https,
            server_tokens: params.server_tokens.clone(),
            real_ip_header: params.real_ip_header.clone(),
            set_real_ip_from: params.set_real_ip_from.clone(),
            real_ip_recursive: params.real_ip_recursive,
            snippets: params.server_snippets.clone(),
            internal_redirect_locations: generated.internal_redirects,
            locations: generated.locations,
        },
        upstreams,
        split_clients: generated.split_clients,
        maps: generated.maps,
    }
}

/// Members per upstream name, for incremental updates
pub fn virtual_server_upstream_members(site: &VirtualServerSite) -> BTreeMap<String, Vec<String>> {
    let vs = site.virtual_server.as_ref();
    let vs_namespace = site.namespace();
    let vs_name = vs.metadata.name.as_deref().unwrap_or_default();

    let mut members = BTreeMap::new();
    let mut add = |namer: &UpstreamNamer, namespace: &str, declared: &[VsUpstream]| {
        for upstream in declared {
            let key = endpoints_key(namespace, &upstream.service, upstream.port);
            members.insert(
                namer.upstream(&upstream.name),
                site.endpoints.get(&key).cloned().unwrap_or_default(),
            );
        }
    };

    add(
        &UpstreamNamer::for_virtual_server(vs_namespace, vs_name),
        vs_namespace,
        &vs.spec.upstreams,
    );
    for vsr in &site.routes {
        let vsr_namespace = vsr.metadata.namespace.as_deref().unwrap_or_default();
        let namer = UpstreamNamer::for_virtual_server_route(
            vs_namespace,
            vs_name,
            vsr_namespace,
            vsr.metadata.name.as_deref().unwrap_or_default(),
        );
        add(&namer, vsr_namespace, &vsr.spec.upstreams);
    }
    members
}
