//! Task Queue
//!
//! Deduplicating FIFO of reconciliation tasks with a single consumer.
//!
//! A task key that is already pending is not queued twice. A key that is
//! re-added while its task is being processed is queued again once the worker
//! calls `done`, so the change is never lost and never processed concurrently.
//!
//! ```text
//!  watchers ──enqueue──► [dirty set + FIFO] ──get──► worker ──done──┐
//!                              ▲                                     │
//!                              └──────── re-added if dirty ◄─────────┘
//! ```

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use super::annotations::is_minion;
use super::cache::{safe_lock, ResourceKey, SERVICE_NAME_LABEL};
use crate::apis::crd::{VirtualServer, VirtualServerRoute};

/// Kind of resource a task reconciles, decided once at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Ingress,
    IngressMinion,
    Endpoints,
    ConfigMap,
    Secret,
    ExternalService,
    VirtualServer,
    VirtualServerRoute,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ingress => "ingress",
            TaskKind::IngressMinion => "ingress_minion",
            TaskKind::Endpoints => "endpoints",
            TaskKind::ConfigMap => "configmap",
            TaskKind::Secret => "secret",
            TaskKind::ExternalService => "external_service",
            TaskKind::VirtualServer => "virtualserver",
            TaskKind::VirtualServerRoute => "virtualserverroute",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of reconciliation work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    pub kind: TaskKind,
    pub key: ResourceKey,
}

impl Task {
    pub fn new(kind: TaskKind, key: ResourceKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Resources that can be turned into a task
pub trait IntoTask {
    fn to_task(&self) -> Option<Task>;
}

impl IntoTask for Ingress {
    fn to_task(&self) -> Option<Task> {
        let kind = if is_minion(self) {
            TaskKind::IngressMinion
        } else {
            TaskKind::Ingress
        };
        Some(Task::new(kind, ResourceKey::of(self)))
    }
}

/// Slices are keyed by the Service they belong to
impl IntoTask for EndpointSlice {
    fn to_task(&self) -> Option<Task> {
        let namespace = self.metadata.namespace.clone()?;
        let service = self.metadata.labels.as_ref()?.get(SERVICE_NAME_LABEL)?;
        Some(Task::new(
            TaskKind::Endpoints,
            ResourceKey::new(namespace, service.clone()),
        ))
    }
}

impl IntoTask for ConfigMap {
    fn to_task(&self) -> Option<Task> {
        Some(Task::new(TaskKind::ConfigMap, ResourceKey::of(self)))
    }
}

impl IntoTask for Secret {
    fn to_task(&self) -> Option<Task> {
        Some(Task::new(TaskKind::Secret, ResourceKey::of(self)))
    }
}

impl IntoTask for Service {
    fn to_task(&self) -> Option<Task> {
        Some(Task::new(TaskKind::ExternalService, ResourceKey::of(self)))
    }
}

impl IntoTask for VirtualServer {
    fn to_task(&self) -> Option<Task> {
        Some(Task::new(TaskKind::VirtualServer, ResourceKey::of(self)))
    }
}

impl IntoTask for VirtualServerRoute {
    fn to_task(&self) -> Option<Task> {
        Some(Task::new(TaskKind::VirtualServerRoute, ResourceKey::of(self)))
    }
}

/// The consumer side of the queue. Owns whatever state syncing mutates.
#[async_trait]
pub trait SyncHandler: Send {
    async fn sync(&mut self, task: Task);
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Task>,
    dirty: HashSet<Task>,
    processing: HashSet<Task>,
    shutting_down: bool,
}

/// Deduplicating work queue
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    worker_started: AtomicBool,
    worker_done: watch::Sender<bool>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (worker_done, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            worker_started: AtomicBool::new(false),
            worker_done,
        }
    }

    /// Enqueue the task for a resource
    pub fn enqueue<R: IntoTask>(&self, resource: &R) {
        match resource.to_task() {
            Some(task) => {
                debug!(task = %task, "Adding task");
                self.add(task);
            }
            None => debug!("Couldn't create a task for resource"),
        }
    }

    /// Add a task unless it is already pending
    pub fn add(&self, task: Task) {
        let mut state = safe_lock(&self.state);
        if state.shutting_down || state.dirty.contains(&task) {
            return;
        }
        state.dirty.insert(task.clone());
        if state.processing.contains(&task) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(task);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next task. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = safe_lock(&self.state);
                if let Some(task) = state.queue.pop_front() {
                    state.dirty.remove(&task);
                    state.processing.insert(task.clone());
                    return Some(task);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a task as processed
    pub fn done(&self, task: &Task) {
        let mut state = safe_lock(&self.state);
        state.processing.remove(task);
        if state.dirty.contains(task) {
            state.queue.push_back(task.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-add immediately (transient errors)
    pub fn requeue(&self, task: Task, err: &dyn fmt::Display) {
        error!(key = %task.key, error = %err, "Requeuing task");
        self.add(task);
    }

    /// Re-add after `delay` on a separate timer
    pub fn requeue_after(self: &Arc<Self>, task: Task, err: &dyn fmt::Display, delay: Duration) {
        error!(key = %task.key, error = %err, delay = ?delay, "Requeuing task after delay");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(task);
        });
    }

    pub fn len(&self) -> usize {
        safe_lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        safe_lock(&self.state).shutting_down
    }

    /// Run the single worker until the queue is shut down and drained.
    ///
    /// `done` is called after every task regardless of its outcome.
    pub async fn run<H: SyncHandler>(&self, handler: &mut H) {
        self.worker_started.store(true, Ordering::SeqCst);
        while let Some(task) = self.get().await {
            debug!(task = %task, "Syncing");
            handler.sync(task.clone()).await;
            self.done(&task);
        }
        self.worker_done.send_replace(true);
        debug!("Task queue worker exited");
    }

    /// Close the queue and wait for the worker to drain and exit
    pub async fn shutdown(&self) {
        safe_lock(&self.state).shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();

        if !self.worker_started.load(Ordering::SeqCst) {
            return;
        }
        let mut done = self.worker_done.subscribe();
        // Sender is owned by self, so wait_for can only fail if self is gone
        let _ = done.wait_for(|exited| *exited).await;
    }
}
