//! Resource watchers
//!
//! Each watched kind runs one kube reflector. The reflector keeps the
//! `Store` the reconciler reads from, and every event on it turns into a
//! task on the queue. Watchers never reconcile anything themselves.
//!
//! ```text
//!  API server ──► watcher ──► reflector ──► Store<K> ──► Stores
//!                                 │
//!                                 └──► event handler ──► TaskQueue
//! ```

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::crd::{VirtualServer, VirtualServerRoute};
use crate::config::ControllerConfig;
use crate::reconcile::annotations::has_ingress_class;
use crate::reconcile::cache::{KeyIndex, MemoryStore, ResourceKey, ResourceStore, Stores};
use crate::reconcile::fragment::RouteFragment;
use crate::reconcile::secrets::is_supported_secret;
use crate::reconcile::task_queue::{Task, TaskKind, TaskQueue};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

/// What happened to a watched object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    Deleted,
}

type EventStream<K> = std::pin::Pin<Box<dyn Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send>>;

/// Reflector-backed store and the event stream that keeps it current
fn reflect<K>(api: Api<K>, config: watcher::Config) -> (Store<K>, EventStream<K>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, config)).default_backoff();
    (reader, Box::pin(stream))
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Last known state of every object one watcher has seen.
///
/// A relist (after a desync or an expired resource version) only replays the
/// objects that still exist. Known objects missing from the relist are turned
/// into deletions, carrying their last known state.
struct Relist<K> {
    known: KeyIndex<K>,
    relisted: Option<HashSet<ResourceKey>>,
}

impl<K: Resource + Clone> Relist<K> {
    fn new() -> Self {
        Self {
            known: KeyIndex::new(),
            relisted: None,
        }
    }

    /// Object changes carried by one watcher event
    fn changes(&mut self, event: watcher::Event<K>) -> Vec<(K, Change)> {
        match event {
            watcher::Event::Apply(obj) => {
                self.known.insert(ResourceKey::of(&obj), obj.clone());
                vec![(obj, Change::Applied)]
            }
            watcher::Event::InitApply(obj) => {
                let key = ResourceKey::of(&obj);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                self.known.insert(key, obj.clone());
                vec![(obj, Change::Applied)]
            }
            watcher::Event::Delete(obj) => {
                self.known.remove(&ResourceKey::of(&obj));
                vec![(obj, Change::Deleted)]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let vanished: Vec<ResourceKey> = self
                    .known
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(|obj| (obj, Change::Deleted))
                    .collect()
            }
        }
    }
}

/// Drive one event stream, calling `on_change` for every object event
async fn drive<K, F>(kind: &'static str, mut stream: EventStream<K>, mut on_change: F)
where
    K: Resource + Clone + Send + 'static,
    F: FnMut(&K, Change) + Send + 'static,
{
    info!("Starting {} watcher", kind);
    let mut relist = Relist::new();
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("{} watcher error: {}", kind, e);
                continue;
            }
        };
        match &event {
            watcher::Event::Init => debug!("{} watcher (re)listing", kind),
            watcher::Event::InitDone => info!("{} watcher list complete", kind),
            _ => {}
        }
        for (obj, change) in relist.changes(event) {
            if change == Change::Deleted {
                debug!(kind, key = %ResourceKey::of(&obj), "Object deleted");
            }
            on_change(&obj, change);
        }
    }
    warn!("{} watcher stream ended", kind);
}

// =============================================================================
// Event handlers
// =============================================================================

/// Enqueues Ingress changes for this controller's class.
///
/// An Ingress that leaves the class is still enqueued once so its config is
/// removed. Updates that leave annotations and generation untouched (status
/// writes) are skipped.
pub struct IngressHandler {
    ingress_class: String,
    use_ingress_class_only: bool,
    seen: KeyIndex<(bool, String)>,
}

impl IngressHandler {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            ingress_class: config.ingress_class.clone(),
            use_ingress_class_only: config.use_ingress_class_only,
            seen: KeyIndex::new(),
        }
    }

    fn fingerprint(ing: &Ingress) -> String {
        format!("{:?}/{:?}", ing.metadata.generation, ing.metadata.annotations)
    }

    pub fn handle(&mut self, ing: &Ingress, change: Change, queue: &TaskQueue) {
        let key = ResourceKey::of(ing);
        let managed = has_ingress_class(ing, &self.ingress_class, self.use_ingress_class_only);

        let previous = match change {
            Change::Deleted => self.seen.remove(&key),
            Change::Applied => self
                .seen
                .insert(key.clone(), (managed, Self::fingerprint(ing))),
        };
        let was_managed = previous.as_ref().is_some_and(|(m, _)| *m);

        if !managed && !was_managed {
            debug!(key = %key, "Ignoring Ingress of another class");
            return;
        }
        if change == Change::Applied
            && previous.is_some_and(|(m, f)| m == managed && f == Self::fingerprint(ing))
        {
            debug!(key = %key, "Ingress status update, skipping");
            return;
        }
        queue.enqueue(ing);
    }
}

/// Only TLS and JWK secrets matter to the reconciler
pub fn handle_secret(secret: &Secret, queue: &TaskQueue) {
    if is_supported_secret(secret) {
        queue.enqueue(secret);
    }
}

/// The external Service updates status addresses. Any other Service
/// re-syncs the Ingresses and VirtualServers that use it.
pub fn handle_service(svc: &Service, stores: &Stores, external: Option<&ResourceKey>, queue: &TaskQueue) {
    let key = ResourceKey::of(svc);
    if external == Some(&key) {
        queue.add(Task::new(TaskKind::ExternalService, key));
        return;
    }

    match stores.ingresses.list() {
        Ok(ingresses) => {
            for ing in ingresses {
                let fragment = RouteFragment::from_ingress(&ing);
                if fragment.key.namespace == key.namespace && fragment.references_service(&key.name) {
                    queue.enqueue(ing.as_ref());
                }
            }
        }
        Err(e) => warn!(key = %key, "Couldn't list Ingresses for Service: {}", e),
    }

    let uses_service = |namespace: &str, upstreams: &[crate::apis::crd::VsUpstream]| {
        namespace == key.namespace && upstreams.iter().any(|u| u.service == key.name)
    };
    if let Ok(virtual_servers) = stores.virtual_servers.list() {
        for vs in virtual_servers {
            if uses_service(&ResourceKey::of(vs.as_ref()).namespace, &vs.spec.upstreams) {
                queue.enqueue(vs.as_ref());
            }
        }
    }
    if let Ok(routes) = stores.virtual_server_routes.list() {
        for vsr in routes {
            if uses_service(&ResourceKey::of(vsr.as_ref()).namespace, &vsr.spec.upstreams) {
                queue.enqueue(vsr.as_ref());
            }
        }
    }
}

// =============================================================================
// Startup
// =============================================================================

/// Running watchers and the stores they fill
pub struct Watchers {
    pub stores: Stores,
    handles: Vec<JoinHandle<()>>,
    ready: Vec<BoxFuture<'static, bool>>,
}

impl Watchers {
    /// Wait until every store has finished its initial list. Returns false
    /// when a watcher exited before that.
    pub async fn wait_until_ready(&mut self) -> bool {
        let ready = std::mem::take(&mut self.ready);
        futures::future::join_all(ready)
            .await
            .into_iter()
            .all(|ok| ok)
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn readiness<K>(store: &Store<K>) -> BoxFuture<'static, bool>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let store = store.clone();
    Box::pin(async move { store.wait_until_ready().await.is_ok() })
}

/// Start every watcher the configuration asks for.
///
/// Kinds that are not watched (custom resources when disabled, Pods on OSS,
/// the ConfigMap when none is configured) are served from empty in-memory
/// stores.
pub fn start(client: &Client, config: &ControllerConfig, queue: Arc<TaskQueue>) -> Watchers {
    let namespace = config.watch_namespace.as_deref();
    let mut ready = Vec::new();
    let mut handles = Vec::new();

    let (ingresses, ingress_events) = reflect::<Ingress>(api(client, namespace), watcher::Config::default());
    let (services, service_events) = reflect::<Service>(api(client, namespace), watcher::Config::default());
    let (slices, slice_events) =
        reflect::<EndpointSlice>(api(client, namespace), watcher::Config::default());
    let (secrets, secret_events) = reflect::<Secret>(api(client, namespace), watcher::Config::default());
    ready.extend([
        readiness(&ingresses),
        readiness(&services),
        readiness(&slices),
        readiness(&secrets),
    ]);

    let config_map_key = config.config_map_key();
    let config_maps: Arc<dyn ResourceStore<ConfigMap>> = match &config_map_key {
        Some(key) => {
            let cfg = watcher::Config::default().fields(&format!("metadata.name={}", key.name));
            let (store, events) = reflect::<ConfigMap>(api(client, Some(&key.namespace)), cfg);
            ready.push(readiness(&store));
            let queue = queue.clone();
            handles.push(tokio::spawn(drive("ConfigMap", events, move |cm: &ConfigMap, _| {
                queue.enqueue(cm)
            })));
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::<ConfigMap>::new("configmaps")),
    };

    let pods: Arc<dyn ResourceStore<Pod>> = if config.nginx_plus {
        let (store, events) = reflect::<Pod>(api(client, namespace), watcher::Config::default());
        ready.push(readiness(&store));
        // Only read for health probes, changes arrive through EndpointSlices
        handles.push(tokio::spawn(drive("Pod", events, |_: &Pod, _| {})));
        Arc::new(store)
    } else {
        Arc::new(MemoryStore::<Pod>::new("pods"))
    };

    let mut custom_events = None;
    let (virtual_servers, virtual_server_routes): (
        Arc<dyn ResourceStore<VirtualServer>>,
        Arc<dyn ResourceStore<VirtualServerRoute>>,
    ) = if config.enable_custom_resources {
        let (vs, vs_events) = reflect::<VirtualServer>(api(client, namespace), watcher::Config::default());
        let (vsr, vsr_events) =
            reflect::<VirtualServerRoute>(api(client, namespace), watcher::Config::default());
        ready.push(readiness(&vs));
        ready.push(readiness(&vsr));
        custom_events = Some((vs_events, vsr_events));
        (Arc::new(vs), Arc::new(vsr))
    } else {
        (
            Arc::new(MemoryStore::<VirtualServer>::new("virtualservers")),
            Arc::new(MemoryStore::<VirtualServerRoute>::new("virtualserverroutes")),
        )
    };

    let stores = Stores {
        ingresses: Arc::new(ingresses),
        services: Arc::new(services),
        endpoint_slices: Arc::new(slices),
        secrets: Arc::new(secrets),
        config_maps,
        pods,
        virtual_servers,
        virtual_server_routes,
    };

    let mut ingress_handler = IngressHandler::new(config);
    let q = queue.clone();
    handles.push(tokio::spawn(drive("Ingress", ingress_events, move |ing: &Ingress, change| {
        ingress_handler.handle(ing, change, &q)
    })));

    let q = queue.clone();
    handles.push(tokio::spawn(drive("EndpointSlice", slice_events, move |slice: &EndpointSlice, _| {
        q.enqueue(slice)
    })));

    let q = queue.clone();
    handles.push(tokio::spawn(drive("Secret", secret_events, move |secret: &Secret, _| {
        handle_secret(secret, &q)
    })));

    let q = queue.clone();
    let service_stores = stores.clone();
    let external = config.external_service_key();
    handles.push(tokio::spawn(drive("Service", service_events, move |svc: &Service, _| {
        handle_service(svc, &service_stores, external.as_ref(), &q)
    })));

    if let Some((vs_events, vsr_events)) = custom_events {
        let q = queue.clone();
        handles.push(tokio::spawn(drive("VirtualServer", vs_events, move |vs: &VirtualServer, _| {
            q.enqueue(vs)
        })));
        let q = queue.clone();
        handles.push(tokio::spawn(drive(
            "VirtualServerRoute",
            vsr_events,
            move |vsr: &VirtualServerRoute, _| q.enqueue(vsr),
        )));
    }

    handles.push(tokio::spawn(liveness(queue)));

    Watchers {
        stores,
        handles,
        ready,
    }
}

/// Periodic heartbeat with the queue depth
async fn liveness(queue: Arc<TaskQueue>) {
    let mut interval = tokio::time::interval(LIVENESS_INTERVAL);
    loop {
        interval.tick().await;
        if queue.is_shutting_down() {
            return;
        }
        debug!(pending = queue.len(), "Controller alive");
    }
}

/// Stores keyed by kind for log output
pub fn watched_kinds(config: &ControllerConfig) -> BTreeMap<&'static str, bool> {
    BTreeMap::from([
        ("ingresses", true),
        ("services", true),
        ("endpointslices", true),
        ("secrets", true),
        ("configmaps", config.config_map_key().is_some()),
        ("pods", config.nginx_plus),
        ("virtualservers", config.enable_custom_resources),
        ("virtualserverroutes", config.enable_custom_resources),
    ])
}
