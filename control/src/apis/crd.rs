//! VirtualServer and VirtualServerRoute Custom Resource Definitions
//!
//! A VirtualServer owns one host. Its routes point at upstreams directly,
//! split traffic by weight, match request attributes, or delegate a path
//! prefix to a VirtualServerRoute.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a VirtualServer
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1alpha1",
    kind = "VirtualServer",
    plural = "virtualservers",
    shortname = "vs",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct VirtualServerSpec {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<VirtualServerTls>,

    #[serde(default)]
    pub upstreams: Vec<VsUpstream>,

    #[serde(default)]
    pub routes: Vec<VsRoute>,
}

/// Specification for a VirtualServerRoute
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1alpha1",
    kind = "VirtualServerRoute",
    plural = "virtualserverroutes",
    shortname = "vsr",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct VirtualServerRouteSpec {
    pub host: String,

    #[serde(default)]
    pub upstreams: Vec<VsUpstream>,

    #[serde(default)]
    pub subroutes: Vec<VsRoute>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VirtualServerTls {
    #[serde(default)]
    pub secret: String,
}

/// A named backend Service port with load-balancing and proxy options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VsUpstream {
    pub name: String,
    pub service: String,
    pub port: u16,

    #[serde(default, rename = "lb-method")]
    pub lb_method: String,

    #[serde(default, rename = "fail-timeout")]
    pub fail_timeout: String,

    #[serde(default, rename = "max-fails", skip_serializing_if = "Option::is_none")]
    pub max_fails: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<i64>,

    #[serde(default, rename = "connect-timeout")]
    pub connect_timeout: String,

    #[serde(default, rename = "read-timeout")]
    pub read_timeout: String,

    #[serde(default, rename = "send-timeout")]
    pub send_timeout: String,

    #[serde(default)]
    pub tls: UpstreamTls,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct UpstreamTls {
    #[serde(default)]
    pub enable: bool,
}

/// A path with exactly one action: upstream, splits, rules or route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VsRoute {
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upstream: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<Split>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Rules>,

    /// `name` or `namespace/name` of a VirtualServerRoute
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Split {
    pub weight: u32,
    pub upstream: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rules {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub matches: Vec<Match>,

    pub default_upstream: String,
}

/// Exactly one of the fields is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub header: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cookie: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub argument: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variable: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Match {
    #[serde(default)]
    pub values: Vec<String>,

    pub upstream: String,
}

impl VsRoute {
    /// Key of the referenced VirtualServerRoute, defaulting to `namespace`
    pub fn route_key(&self, namespace: &str) -> Option<String> {
        if self.route.is_empty() {
            return None;
        }
        if self.route.contains('/') {
            Some(self.route.clone())
        } else {
            Some(format!("{}/{}", namespace, self.route))
        }
    }
}
