use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Api;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use control::apis::status::KubeReporter;
use control::apis::watchers;
use control::config::ControllerConfig;
use control::controller::Controller;
use control::proxy::manager::LocalManager;
use control::proxy::renderer::{JsonRenderer, Renderer};
use control::reconcile::cache::ResourceKey;
use control::reconcile::configurator::Configurator;
use control::reconcile::params::ConfigParams;
use control::reconcile::reporter::{LogReporter, Reporter};
use control::reconcile::secrets::{
    validate_tls_secret, DEFAULT_SERVER_SECRET_NAME, WILDCARD_SECRET_NAME,
};
use control::reconcile::task_queue::TaskQueue;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Read and validate a TLS secret the proxy cannot start without
async fn read_special_secret(client: &kube::Client, key: &ResourceKey) -> Result<Secret> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &key.namespace);
    let secret = api
        .get(&key.name)
        .await
        .with_context(|| format!("Error trying to get the secret {}", key))?;
    validate_tls_secret(&secret).with_context(|| format!("Secret {} is invalid", key))?;
    Ok(secret)
}

async fn initial_params(client: &kube::Client, config: &ControllerConfig) -> Result<ConfigParams> {
    let Some(key) = config.config_map_key() else {
        return Ok(ConfigParams::default());
    };
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &key.namespace);
    match api
        .get_opt(&key.name)
        .await
        .with_context(|| format!("Error when getting {}", key))?
    {
        Some(cm) => Ok(ConfigParams::from_config_map(&cm, config.nginx_plus)),
        None => {
            warn!("ConfigMap {} not found, using the defaults", key);
            Ok(ConfigParams::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::from_env().context("Invalid configuration")?;
    info!(
        class = %config.ingress_class,
        plus = config.nginx_plus,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        "Starting ingress reconciler"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let params = initial_params(&client, &config).await?;
    let mut renderer = JsonRenderer::new();
    renderer.update_main_template(params.main_template.as_deref())?;
    renderer.update_ingress_template(params.ingress_template.as_deref())?;

    let plus_api_url = (config.nginx_plus && !config.proxy.plus_api_url.is_empty())
        .then(|| config.proxy.plus_api_url.clone());
    let manager = LocalManager::new(
        &config.proxy.conf_path,
        config.proxy.binary_path.clone(),
        config.proxy.config_version_url.clone(),
        plus_api_url,
        config.reload_timeout(),
    );
    let configurator = Configurator::new(
        Arc::new(manager),
        Box::new(renderer),
        params,
        config.static_params(),
        config.nginx_plus,
        config.wildcard_tls_secret_key().is_some(),
    );
    configurator
        .write_main_config()
        .await
        .context("Error when writing main config")?;

    // The proxy serves the default server from this secret: fail fast
    if let Some(key) = config.default_server_secret_key() {
        let secret = read_special_secret(&client, &key).await?;
        configurator
            .write_special_secret(&secret, &[DEFAULT_SERVER_SECRET_NAME])
            .await
            .with_context(|| format!("Error when writing the default server secret {}", key))?;
    } else {
        warn!("No default server secret configured");
    }
    if let Some(key) = config.wildcard_tls_secret_key() {
        let secret = read_special_secret(&client, &key).await?;
        configurator
            .write_special_secret(&secret, &[WILDCARD_SECRET_NAME])
            .await
            .with_context(|| format!("Error when writing the wildcard secret {}", key))?;
    }

    let queue = Arc::new(TaskQueue::new());
    let mut watchers = watchers::start(&client, &config, queue.clone());
    for (kind, watched) in watchers::watched_kinds(&config) {
        info!(kind, watched, "Resource cache");
    }
    if !watchers.wait_until_ready().await {
        anyhow::bail!("A watcher stopped before its initial sync");
    }
    info!(pending = queue.len(), "Caches synced");

    let reporter: Arc<dyn Reporter> = if config.status.report_ingress_status {
        Arc::new(KubeReporter::new(
            client.clone(),
            &config.controller_name,
            config.status.pod_name.clone(),
        ))
    } else {
        Arc::new(LogReporter)
    };

    let mut controller = Controller::new(
        watchers.stores.clone(),
        queue.clone(),
        configurator,
        reporter,
        config,
    );
    let worker_queue = queue.clone();
    let worker = tokio::spawn(async move {
        worker_queue.run(&mut controller).await;
    });

    info!("Press Ctrl-C to exit.");
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Lets the in-flight task finish
    queue.shutdown().await;
    watchers.abort();
    worker.await?;

    Ok(())
}
