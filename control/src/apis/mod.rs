//! Kubernetes API integrations
//!
//! - crd: VirtualServer and VirtualServerRoute definitions
//! - watchers: reflector-backed caches feeding the task queue
//! - status: Events and Ingress status through the API server
//! - metrics: controller metrics registry

pub mod crd;
pub mod metrics;
pub mod status;
pub mod watchers;
