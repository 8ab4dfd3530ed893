use thiserror::Error;

use crate::proxy::manager::ManagerError;
use crate::reconcile::cache::CacheError;
use crate::reconcile::configurator::ConfiguratorError;
use crate::reconcile::merge::MergeError;
use crate::reconcile::resolver::ResolveError;
use crate::reconcile::secrets::SecretError;
use crate::reconcile::virtualserver::VirtualServerError;

/// Controller errors
///
/// Umbrella over the per-layer errors. The dispatcher only needs to know
/// which ones are transient (worth a requeue) and which ones reject a fragment.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("VirtualServer error: {0}")]
    VirtualServer(#[from] VirtualServerError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Configurator error: {0}")]
    Configurator(#[from] ConfiguratorError),

    #[error("Proxy manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Startup error: {0}")]
    Startup(String),
}

impl ControllerError {
    /// Transient errors are retried with an immediate requeue.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Cache(_) | ControllerError::Kubernetes(_) => true,
            ControllerError::Resolve(e) => e.is_transient(),
            ControllerError::Merge(e) => e.is_transient(),
            ControllerError::VirtualServer(e) => e.is_transient(),
            _ => false,
        }
    }
}
