//! Resource cache access
//!
//! The reconciler never talks to the API server directly. Every task re-reads
//! the current state through `ResourceStore`, which is backed by a kube
//! reflector in production and by `MemoryStore` in tests.
//!
//! ```text
//!  watcher ──► reflector::Store<K> ──┐
//!                                    ├──► ResourceStore<K> ──► resolver / dispatcher
//!  tests ───► MemoryStore<K> ────────┘
//! ```

use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::warn;

use crate::apis::crd::{VirtualServer, VirtualServerRoute};

/// Label EndpointSlices carry to point at their Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache for {0} is unavailable")]
    Unavailable(String),
}

// =============================================================================
// ResourceKey
// =============================================================================

/// Key for namespaced resources: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    #[inline]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`. Both halves must be non-empty.
    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::from_meta(obj.meta())
    }

    /// `namespace-name`, used for config and secret file names
    pub fn file_name(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// ResourceStore
// =============================================================================

/// Read access to one kind of cached resource
pub trait ResourceStore<K>: Send + Sync {
    fn get_by_key(&self, key: &ResourceKey) -> Result<Option<Arc<K>>, CacheError>;

    fn list(&self) -> Result<Vec<Arc<K>>, CacheError>;
}

impl<K> ResourceStore<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get_by_key(&self, key: &ResourceKey) -> Result<Option<Arc<K>>, CacheError> {
        Ok(self.get(&ObjectRef::new(&key.name).within(&key.namespace)))
    }

    fn list(&self) -> Result<Vec<Arc<K>>, CacheError> {
        Ok(self.state())
    }
}

/// In-memory store
///
/// Holds objects by key and can be switched into an unavailable state to
/// exercise the requeue path.
pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<ResourceKey, Arc<K>>>,
    unavailable: AtomicBool,
    kind: &'static str,
}

impl<K: Resource> MemoryStore<K> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
            kind,
        }
    }

    pub fn apply(&self, obj: K) {
        let key = ResourceKey::of(&obj);
        safe_write(&self.objects).insert(key, Arc::new(obj));
    }

    pub fn delete(&self, key: &ResourceKey) -> Option<Arc<K>> {
        safe_write(&self.objects).remove(key)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable(self.kind.to_string()));
        }
        Ok(())
    }
}

impl<K: Resource + Send + Sync> ResourceStore<K> for MemoryStore<K> {
    fn get_by_key(&self, key: &ResourceKey) -> Result<Option<Arc<K>>, CacheError> {
        self.check()?;
        Ok(safe_read(&self.objects).get(key).cloned())
    }

    fn list(&self) -> Result<Vec<Arc<K>>, CacheError> {
        self.check()?;
        Ok(safe_read(&self.objects).values().cloned().collect())
    }
}

// =============================================================================
// Stores
// =============================================================================

/// All caches the reconciler reads from
#[derive(Clone)]
pub struct Stores {
    pub ingresses: Arc<dyn ResourceStore<Ingress>>,
    pub services: Arc<dyn ResourceStore<Service>>,
    pub endpoint_slices: Arc<dyn ResourceStore<EndpointSlice>>,
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    pub config_maps: Arc<dyn ResourceStore<ConfigMap>>,
    pub pods: Arc<dyn ResourceStore<Pod>>,
    pub virtual_servers: Arc<dyn ResourceStore<VirtualServer>>,
    pub virtual_server_routes: Arc<dyn ResourceStore<VirtualServerRoute>>,
}

impl Stores {
    /// EndpointSlices labelled for the given Service
    pub fn endpoint_slices_for_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<Arc<EndpointSlice>>, CacheError> {
        Ok(self
            .endpoint_slices
            .list()?
            .into_iter()
            .filter(|slice| {
                slice.metadata.namespace.as_deref() == Some(namespace)
                    && slice
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(SERVICE_NAME_LABEL))
                        .map(String::as_str)
                        == Some(service)
            })
            .collect())
    }

    /// Pods in `namespace` matching every label of `selector`, ordered by name
    pub fn pods_for_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Arc<Pod>>, CacheError> {
        if selector.is_empty() {
            return Ok(Vec::new());
        }
        let mut pods: Vec<Arc<Pod>> = self
            .pods
            .list()?
            .into_iter()
            .filter(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && selector.iter().all(|(k, v)| {
                        pod.metadata
                            .labels
                            .as_ref()
                            .and_then(|labels| labels.get(k))
                            == Some(v)
                    })
            })
            .collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(pods)
    }
}

/// Memory-backed `Stores`, keeping typed handles for direct mutation
#[derive(Clone)]
pub struct MemoryStores {
    pub ingresses: Arc<MemoryStore<Ingress>>,
    pub services: Arc<MemoryStore<Service>>,
    pub endpoint_slices: Arc<MemoryStore<EndpointSlice>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub config_maps: Arc<MemoryStore<ConfigMap>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub virtual_servers: Arc<MemoryStore<VirtualServer>>,
    pub virtual_server_routes: Arc<MemoryStore<VirtualServerRoute>>,
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            ingresses: Arc::new(MemoryStore::new("ingresses")),
            services: Arc::new(MemoryStore::new("services")),
            endpoint_slices: Arc::new(MemoryStore::new("endpointslices")),
            secrets: Arc::new(MemoryStore::new("secrets")),
            config_maps: Arc::new(MemoryStore::new("configmaps")),
            pods: Arc::new(MemoryStore::new("pods")),
            virtual_servers: Arc::new(MemoryStore::new("virtualservers")),
            virtual_server_routes: Arc::new(MemoryStore::new("virtualserverroutes")),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            ingresses: self.ingresses.clone(),
            services: self.services.clone(),
            endpoint_slices: self.endpoint_slices.clone(),
            secrets: self.secrets.clone(),
            config_maps: self.config_maps.clone(),
            pods: self.pods.clone(),
            virtual_servers: self.virtual_servers.clone(),
            virtual_server_routes: self.virtual_server_routes.clone(),
        }
    }
}

/// Per-key state a watcher keeps between events
pub(crate) type KeyIndex<V> = HashMap<ResourceKey, V>;

// =============================================================================
// Lock helpers
// =============================================================================

/// Safe RwLock read helper that recovers from poisoning
#[inline]
pub(crate) fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during read, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe RwLock write helper that recovers from poisoning
#[inline]
pub(crate) fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during write, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
pub(crate) fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}
