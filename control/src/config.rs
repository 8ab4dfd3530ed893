//! Configuration for the ingress reconciler
//!
//! Process-level settings fixed at startup. Settings that can change at
//! runtime (timeouts, TLS options, templates) come from the override
//! ConfigMap and live in `reconcile::params::ConfigParams`.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::reconcile::cache::ResourceKey;
use crate::reconcile::params::StaticConfigParams;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Name used as the event reporter and status field manager
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Value of `kubernetes.io/ingress.class` this controller handles
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Ignore Ingresses without the class annotation
    #[serde(default)]
    pub use_ingress_class_only: bool,

    /// Target proxy supports the incremental upstream API
    #[serde(default)]
    pub nginx_plus: bool,

    /// Watch a single namespace instead of the whole cluster
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// `namespace/name` of the override ConfigMap
    #[serde(default)]
    pub config_map: Option<String>,

    /// `namespace/name` of the default server TLS Secret (required)
    #[serde(default)]
    pub default_server_secret: Option<String>,

    /// `namespace/name` of the wildcard TLS Secret
    #[serde(default)]
    pub wildcard_tls_secret: Option<String>,

    /// Watch VirtualServer and VirtualServerRoute resources
    #[serde(default)]
    pub enable_custom_resources: bool,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// Ingress status reporting
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatusConfig {
    /// Write load balancer addresses into Ingress status
    #[serde(default)]
    pub report_ingress_status: bool,

    /// `namespace/name` of the Service whose addresses are reported
    #[serde(default)]
    pub external_service: Option<String>,

    /// Static address reported instead of the external Service's
    #[serde(default)]
    pub external_status_address: Option<String>,

    /// Name of this pod, used as the event reporter instance
    #[serde(default)]
    pub pod_name: Option<String>,
}

/// Proxy process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Root of the proxy configuration (`nginx.conf`, `conf.d/`, `secrets/`)
    #[serde(default = "default_conf_path")]
    pub conf_path: String,

    #[serde(default = "default_binary_path")]
    pub binary_path: String,

    /// Endpoint answering with the config version the proxy has loaded
    #[serde(default = "default_config_version_url")]
    pub config_version_url: String,

    /// Base URL of the incremental upstream API (Plus only)
    #[serde(default = "default_plus_api_url")]
    pub plus_api_url: String,

    /// How long to wait for the proxy to confirm a reload
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub health_status: bool,

    #[serde(default = "default_true")]
    pub nginx_status: bool,

    #[serde(default = "default_nginx_status_port")]
    pub nginx_status_port: u16,

    #[serde(default = "default_status_allow_cidrs")]
    pub nginx_status_allow_cidrs: Vec<String>,
}

/// Task queue settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Delay before retrying a task whose dependency is not visible yet
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_secs: u64,
}

fn default_controller_name() -> String {
    "nginx-ingress-controller".to_string()
}

fn default_ingress_class() -> String {
    "nginx".to_string()
}

fn default_conf_path() -> String {
    "/etc/nginx".to_string()
}

fn default_binary_path() -> String {
    "/usr/sbin/nginx".to_string()
}

fn default_config_version_url() -> String {
    "http://127.0.0.1:8089/configVersion".to_string()
}

fn default_plus_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_reload_timeout() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

fn default_nginx_status_port() -> u16 {
    8080
}

fn default_status_allow_cidrs() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_requeue_delay() -> u64 {
    5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            conf_path: default_conf_path(),
            binary_path: default_binary_path(),
            config_version_url: default_config_version_url(),
            plus_api_url: default_plus_api_url(),
            reload_timeout_secs: default_reload_timeout(),
            health_status: default_true(),
            nginx_status: default_true(),
            nginx_status_port: default_nginx_status_port(),
            nginx_status_allow_cidrs: default_status_allow_cidrs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            requeue_delay_secs: default_requeue_delay(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            ingress_class: default_ingress_class(),
            use_ingress_class_only: false,
            nginx_plus: false,
            watch_namespace: None,
            config_map: None,
            default_server_secret: None,
            wildcard_tls_secret: None,
            enable_custom_resources: false,
            status: StatusConfig::default(),
            proxy: ProxyConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `NIC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("NIC_CONTROLLER_NAME") {
            config.controller_name = val;
        }
        if let Ok(val) = env::var("NIC_INGRESS_CLASS") {
            config.ingress_class = val;
        }
        if let Some(val) = parse_env("NIC_USE_INGRESS_CLASS_ONLY")? {
            config.use_ingress_class_only = val;
        }
        if let Some(val) = parse_env("NIC_NGINX_PLUS")? {
            config.nginx_plus = val;
        }
        if let Some(val) = parse_env("NIC_ENABLE_CUSTOM_RESOURCES")? {
            config.enable_custom_resources = val;
        }

        config.watch_namespace = non_empty_env("NIC_WATCH_NAMESPACE");
        config.config_map = non_empty_env("NIC_CONFIG_MAP");
        config.default_server_secret = non_empty_env("NIC_DEFAULT_SERVER_SECRET");
        config.wildcard_tls_secret = non_empty_env("NIC_WILDCARD_TLS_SECRET");

        // Status reporting
        if let Some(val) = parse_env("NIC_REPORT_INGRESS_STATUS")? {
            config.status.report_ingress_status = val;
        }
        config.status.external_service = non_empty_env("NIC_EXTERNAL_SERVICE");
        config.status.external_status_address = non_empty_env("NIC_EXTERNAL_STATUS_ADDRESS");
        config.status.pod_name = non_empty_env("POD_NAME");

        // Proxy process
        if let Ok(val) = env::var("NIC_NGINX_CONF_PATH") {
            config.proxy.conf_path = val;
        }
        if let Ok(val) = env::var("NIC_NGINX_BINARY") {
            config.proxy.binary_path = val;
        }
        if let Ok(val) = env::var("NIC_CONFIG_VERSION_URL") {
            config.proxy.config_version_url = val;
        }
        if let Ok(val) = env::var("NIC_PLUS_API_URL") {
            config.proxy.plus_api_url = val;
        }
        if let Some(val) = parse_env("NIC_RELOAD_TIMEOUT_SECS")? {
            config.proxy.reload_timeout_secs = val;
        }
        if let Some(val) = parse_env("NIC_HEALTH_STATUS")? {
            config.proxy.health_status = val;
        }
        if let Some(val) = parse_env("NIC_NGINX_STATUS")? {
            config.proxy.nginx_status = val;
        }
        if let Some(val) = parse_env("NIC_NGINX_STATUS_PORT")? {
            config.proxy.nginx_status_port = val;
        }
        if let Some(val) = non_empty_env("NIC_NGINX_STATUS_ALLOW_CIDRS") {
            config.proxy.nginx_status_allow_cidrs =
                val.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Some(val) = parse_env("NIC_REQUEUE_DELAY_SECS")? {
            config.queue.requeue_delay_secs = val;
        }

        Ok(config)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.queue.requeue_delay_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.reload_timeout_secs)
    }

    pub fn static_params(&self) -> StaticConfigParams {
        StaticConfigParams {
            health_status: self.proxy.health_status,
            nginx_status: self.proxy.nginx_status,
            nginx_status_port: self.proxy.nginx_status_port,
            nginx_status_allow_cidrs: self.proxy.nginx_status_allow_cidrs.clone(),
        }
    }

    pub fn config_map_key(&self) -> Option<ResourceKey> {
        self.config_map.as_deref().and_then(ResourceKey::parse)
    }

    pub fn default_server_secret_key(&self) -> Option<ResourceKey> {
        self.default_server_secret
            .as_deref()
            .and_then(ResourceKey::parse)
    }

    pub fn wildcard_tls_secret_key(&self) -> Option<ResourceKey> {
        self.wildcard_tls_secret
            .as_deref()
            .and_then(ResourceKey::parse)
    }

    pub fn external_service_key(&self) -> Option<ResourceKey> {
        self.status
            .external_service
            .as_deref()
            .and_then(ResourceKey::parse)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
