//! Ingress reconciler library
//!
//! Exposes the reconciliation core, the proxy integration and the
//! Kubernetes plumbing for the binary and integration tests.

pub mod apis;
pub mod config;
pub mod controller;
pub mod error;
pub mod proxy;
pub mod reconcile;
