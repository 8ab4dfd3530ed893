//! Test framework core infrastructure

pub mod assertions;
pub mod fixtures;

use std::sync::Arc;

use common::{IngressConfig, VirtualServerConfig};
use control::config::ControllerConfig;
use control::controller::Controller;
use control::proxy::fake::FakeManager;
use control::proxy::renderer::JsonRenderer;
use control::reconcile::cache::{MemoryStores, ResourceKey};
use control::reconcile::configurator::Configurator;
use control::reconcile::params::{ConfigParams, StaticConfigParams};
use control::reconcile::reporter::RecordingReporter;
use control::reconcile::task_queue::{SyncHandler, Task, TaskKind, TaskQueue};

/// Test result type
pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Namespace every fixture lives in
pub const NAMESPACE: &str = "default";

/// One controller wired to in-memory caches, a fake proxy and a recording
/// reporter
pub struct TestContext {
    /// Caches the controller reads from
    pub stores: MemoryStores,

    /// Proxy side: files, secrets, reloads
    pub proxy: Arc<FakeManager>,

    /// Events and status changes
    pub reporter: Arc<RecordingReporter>,

    pub queue: Arc<TaskQueue>,

    pub controller: Controller,

    config: ControllerConfig,
}

impl TestContext {
    pub fn new(config: ControllerConfig) -> Self {
        let stores = MemoryStores::new();
        let proxy = Arc::new(FakeManager::new());
        let reporter = Arc::new(RecordingReporter::new());
        let queue = Arc::new(TaskQueue::new());
        let configurator = Configurator::new(
            proxy.clone(),
            Box::new(JsonRenderer::new()),
            ConfigParams::default(),
            StaticConfigParams::default(),
            config.nginx_plus,
            false,
        );
        let controller = Controller::new(
            stores.stores(),
            queue.clone(),
            configurator,
            reporter.clone(),
            config.clone(),
        );
        Self {
            stores,
            proxy,
            reporter,
            queue,
            controller,
            config,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        self.config.clone()
    }

    /// Run one task through the controller
    pub async fn sync(&mut self, kind: TaskKind, name: &str) {
        self.controller.sync(Task::new(kind, key(name))).await;
    }

    /// Process queued tasks until the queue is empty. Returns how many ran.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while !self.queue.is_empty() {
            let Some(task) = self.queue.get().await else {
                break;
            };
            self.controller.sync(task.clone()).await;
            self.queue.done(&task);
            processed += 1;
        }
        processed
    }

    /// Rendered bytes of a live config artifact
    pub fn rendered(&self, name: &str) -> Result<String, Box<dyn std::error::Error>> {
        let bytes = self
            .proxy
            .config(name)
            .ok_or(format!("Config {} was not written", name))?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Parsed Ingress config, skipping the template header line
    pub fn ingress_config(&self, name: &str) -> Result<IngressConfig, Box<dyn std::error::Error>> {
        Ok(serde_json::from_str(body(&self.rendered(name)?)?)?)
    }

    pub fn virtual_server_config(
        &self,
        name: &str,
    ) -> Result<VirtualServerConfig, Box<dyn std::error::Error>> {
        Ok(serde_json::from_str(body(&self.rendered(name)?)?)?)
    }
}

fn body(rendered: &str) -> Result<&str, Box<dyn std::error::Error>> {
    let (_, body) = rendered
        .split_once('\n')
        .ok_or("Rendered config has no header line")?;
    Ok(body)
}

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new(NAMESPACE, name)
}
