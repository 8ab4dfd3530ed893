//! Status and event reporting
//!
//! Every fragment-level outcome goes through a `Reporter`. Reporting is
//! fire-and-forget: implementations log their own failures and never fail
//! the reconciliation that produced the outcome.

use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

use super::cache::{safe_lock, ResourceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Ingress,
    Secret,
    ConfigMap,
    VirtualServer,
    VirtualServerRoute,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::VirtualServer => "VirtualServer",
            ResourceKind::VirtualServerRoute => "VirtualServerRoute",
        }
    }
}

/// The resource an outcome is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub key: ResourceKey,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, key: ResourceKey) -> Self {
        Self { kind, key }
    }

    pub fn ingress(key: &ResourceKey) -> Self {
        Self::new(ResourceKind::Ingress, key.clone())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    AddedOrUpdated,
    AddedOrUpdatedWithWarning,
    AddedOrUpdatedWithError,
    UpdatedWithError,
    Updated,
    Rejected,
    Ignored,
    MissingSecret,
    NoVirtualServersFound,
}

impl Outcome {
    /// Event reason
    pub fn reason(&self) -> &'static str {
        match self {
            Outcome::AddedOrUpdated => "AddedOrUpdated",
            Outcome::AddedOrUpdatedWithWarning => "AddedOrUpdatedWithWarning",
            Outcome::AddedOrUpdatedWithError => "AddedOrUpdatedWithError",
            Outcome::UpdatedWithError => "UpdatedWithError",
            Outcome::Updated => "Updated",
            Outcome::Rejected => "Rejected",
            Outcome::Ignored => "Ignored",
            Outcome::MissingSecret => "MissingSecret",
            Outcome::NoVirtualServersFound => "NoVirtualServersFound",
        }
    }

    pub fn is_warning(&self) -> bool {
        !matches!(self, Outcome::AddedOrUpdated | Outcome::Updated)
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, resource: &ResourceRef, outcome: Outcome, message: &str);

    /// Write the current external addresses into the Ingress status
    async fn update_ingress_status(&self, key: &ResourceKey);

    async fn clear_ingress_status(&self, key: &ResourceKey);

    /// Addresses reported by later status updates; empty clears them
    async fn set_external_addresses(&self, addresses: Vec<String>);
}

/// Reporter used when status reporting is disabled
#[derive(Debug, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, resource: &ResourceRef, outcome: Outcome, message: &str) {
        if outcome.is_warning() {
            warn!(resource = %resource, reason = outcome.reason(), "{}", message);
        } else {
            info!(resource = %resource, reason = outcome.reason(), "{}", message);
        }
    }

    async fn update_ingress_status(&self, _key: &ResourceKey) {}

    async fn clear_ingress_status(&self, _key: &ResourceKey) {}

    async fn set_external_addresses(&self, _addresses: Vec<String>) {}
}

/// One recorded outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub resource: ResourceRef,
    pub outcome: Outcome,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Updated(ResourceKey),
    Cleared(ResourceKey),
}

#[derive(Default)]
struct Recorded {
    reports: Vec<Report>,
    status: Vec<StatusChange>,
    addresses: Vec<String>,
}

/// Reporter that keeps everything it is told, for tests
#[derive(Default)]
pub struct RecordingReporter {
    recorded: Mutex<Recorded>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        safe_lock(&self.recorded).reports.clone()
    }

    pub fn reports_for(&self, resource: &ResourceRef) -> Vec<Report> {
        safe_lock(&self.recorded)
            .reports
            .iter()
            .filter(|r| &r.resource == resource)
            .cloned()
            .collect()
    }

    pub fn status_changes(&self) -> Vec<StatusChange> {
        safe_lock(&self.recorded).status.clone()
    }

    pub fn external_addresses(&self) -> Vec<String> {
        safe_lock(&self.recorded).addresses.clone()
    }

    pub fn clear(&self) {
        let mut recorded = safe_lock(&self.recorded);
        recorded.reports.clear();
        recorded.status.clear();
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn report(&self, resource: &ResourceRef, outcome: Outcome, message: &str) {
        safe_lock(&self.recorded).reports.push(Report {
            resource: resource.clone(),
            outcome,
            message: message.to_string(),
        });
    }

    async fn update_ingress_status(&self, key: &ResourceKey) {
        safe_lock(&self.recorded)
            .status
            .push(StatusChange::Updated(key.clone()));
    }

    async fn clear_ingress_status(&self, key: &ResourceKey) {
        safe_lock(&self.recorded)
            .status
            .push(StatusChange::Cleared(key.clone()));
    }

    async fn set_external_addresses(&self, addresses: Vec<String>) {
        safe_lock(&self.recorded).addresses = addresses;
    }
}
