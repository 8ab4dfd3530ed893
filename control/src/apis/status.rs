//! Kubernetes-backed reporting
//!
//! Outcomes become Events on the resource they are about. Ingress status
//! carries the external addresses of the controller; writing it is a merge
//! patch on the status subresource.
//!
//! Both are fire-and-forget: failures are logged and never reach the
//! dispatcher.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter as EventReporter};
use kube::Client;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::reconcile::cache::{safe_lock, ResourceKey};
use crate::reconcile::reporter::{Outcome, Reporter, ResourceKind, ResourceRef};

const EVENT_ACTION: &str = "Reconcile";

/// API version and kind of the object an outcome is about
fn api_version(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Ingress => "networking.k8s.io/v1",
        ResourceKind::Secret | ResourceKind::ConfigMap => "v1",
        ResourceKind::VirtualServer | ResourceKind::VirtualServerRoute => "k8s.nginx.org/v1alpha1",
    }
}

pub fn object_reference(resource: &ResourceRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(api_version(resource.kind).to_string()),
        kind: Some(resource.kind.as_str().to_string()),
        name: Some(resource.key.name.clone()),
        namespace: Some(resource.key.namespace.clone()),
        ..Default::default()
    }
}

pub fn event_type(outcome: Outcome) -> EventType {
    if outcome.is_warning() {
        EventType::Warning
    } else {
        EventType::Normal
    }
}

/// Status with one load balancer entry per address. IPs and hostnames are
/// told apart by parsing.
pub fn ingress_status(addresses: &[String]) -> IngressStatus {
    let ingress = addresses
        .iter()
        .map(|address| {
            if address.parse::<std::net::IpAddr>().is_ok() {
                IngressLoadBalancerIngress {
                    ip: Some(address.clone()),
                    ..Default::default()
                }
            } else {
                IngressLoadBalancerIngress {
                    hostname: Some(address.clone()),
                    ..Default::default()
                }
            }
        })
        .collect();
    IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: Some(ingress),
        }),
    }
}

/// Reporter writing Events and Ingress status through the API server.
/// Used when status reporting is enabled, `LogReporter` otherwise.
pub struct KubeReporter {
    client: Client,
    recorder: Recorder,
    field_manager: String,
    addresses: Mutex<Vec<String>>,
}

impl KubeReporter {
    pub fn new(client: Client, controller_name: &str, pod_name: Option<String>) -> Self {
        let reporter = EventReporter {
            controller: controller_name.to_string(),
            instance: pod_name,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            field_manager: controller_name.to_string(),
            addresses: Mutex::new(Vec::new()),
        }
    }

    async fn patch_status(&self, key: &ResourceKey, status: IngressStatus) {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({ "status": status });
        match api
            .patch_status(&key.name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => debug!(key = %key, "Updated Ingress status"),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(key = %key, "Ingress is gone, skipping status update")
            }
            Err(e) => warn!(key = %key, "Error updating Ingress status: {}", e),
        }
    }
}

#[async_trait]
impl Reporter for KubeReporter {
    async fn report(&self, resource: &ResourceRef, outcome: Outcome, message: &str) {
        let event = Event {
            type_: event_type(outcome),
            reason: outcome.reason().to_string(),
            note: Some(message.to_string()),
            action: EVENT_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &object_reference(resource)).await {
            warn!(
                resource = %resource,
                reason = outcome.reason(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }

    async fn update_ingress_status(&self, key: &ResourceKey) {
        let addresses = safe_lock(&self.addresses).clone();
        self.patch_status(key, ingress_status(&addresses)).await;
    }

    async fn clear_ingress_status(&self, key: &ResourceKey) {
        self.patch_status(key, ingress_status(&[])).await;
    }

    async fn set_external_addresses(&self, addresses: Vec<String>) {
        *safe_lock(&self.addresses) = addresses;
    }
}
