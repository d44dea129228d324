//! Observes which parts of the add-on currently exist
//!
//! The cluster is the only source of truth: an [`AddOnState`] is read fresh
//! for every reconcile and discarded afterwards.

use crate::{
    gateway::{Gateway, GatewayError, ResourceKind, ResourceRef},
    manifests,
};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::Pod,
};

/// Presence and readiness of a workload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Workload {
    /// The workload resource exists.
    pub exists: bool,

    /// All desired replicas report ready.
    pub ready: bool,
}

/// A snapshot of the add-on's resources in a namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddOnState {
    /// The collector agent set.
    pub collector: Workload,

    /// The relay deployment.
    pub relay: Workload,

    /// The relay service exists.
    pub relay_service: bool,

    /// The relay configuration exists.
    pub relay_config: bool,

    /// The relay client certificate secret exists.
    pub relay_certs: bool,

    /// The UI deployment.
    pub ui: Workload,

    /// The UI service exists.
    pub ui_service: bool,
}

impl AddOnState {
    /// Reads the state of every managed resource in `ns`.
    pub async fn observe(gateway: &dyn Gateway, ns: &str) -> Result<Self, GatewayError> {
        let collector = gateway
            .daemon_set(ns, manifests::COLLECTOR_NAME)
            .await?
            .map(|ds| Workload {
                exists: true,
                ready: daemon_set_ready(&ds),
            })
            .unwrap_or_default();
        let relay = deployment_state(gateway.deployment(ns, manifests::RELAY_NAME).await?);
        let ui = deployment_state(gateway.deployment(ns, manifests::UI_NAME).await?);

        let state = Self {
            collector,
            relay,
            relay_service: gateway.service(ns, manifests::RELAY_NAME).await?.is_some(),
            relay_config: gateway
                .config_map(ns, manifests::RELAY_CONFIG_NAME)
                .await?
                .is_some(),
            relay_certs: gateway
                .secret(ns, manifests::RELAY_CLIENT_CERTS_NAME)
                .await?
                .is_some(),
            ui,
            ui_service: gateway.service(ns, manifests::UI_NAME).await?.is_some(),
        };
        tracing::debug!(?state, %ns, "Observed");
        Ok(state)
    }

    /// Relay resources that do not exist, in creation order.
    pub fn missing_relay(&self) -> Vec<ResourceRef> {
        [
            (self.relay_certs, ResourceKind::Secret, manifests::RELAY_CLIENT_CERTS_NAME),
            (self.relay_config, ResourceKind::ConfigMap, manifests::RELAY_CONFIG_NAME),
            (self.relay.exists, ResourceKind::Deployment, manifests::RELAY_NAME),
            (self.relay_service, ResourceKind::Service, manifests::RELAY_NAME),
        ]
        .into_iter()
        .filter(|(exists, _, _)| !exists)
        .map(|(_, kind, name)| ResourceRef::new(kind, name))
        .collect()
    }

    /// UI resources that do not exist, in creation order.
    pub fn missing_ui(&self) -> Vec<ResourceRef> {
        [
            (self.ui.exists, ResourceKind::Deployment, manifests::UI_NAME),
            (self.ui_service, ResourceKind::Service, manifests::UI_NAME),
        ]
        .into_iter()
        .filter(|(exists, _, _)| !exists)
        .map(|(_, kind, name)| ResourceRef::new(kind, name))
        .collect()
    }
}

fn deployment_state(deployment: Option<Deployment>) -> Workload {
    deployment
        .map(|d| Workload {
            exists: true,
            ready: deployment_ready(&d),
        })
        .unwrap_or_default()
}

/// Returns true if every scheduled collector pod is ready.
pub fn daemon_set_ready(ds: &DaemonSet) -> bool {
    let Some(status) = ds.status.as_ref() else {
        return false;
    };
    status.desired_number_scheduled > 0 && status.number_ready >= status.desired_number_scheduled
}

/// Returns true if the deployment has as many ready replicas as it wants.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    desired > 0 && ready >= desired
}

/// Returns true if the pod is running and its `Ready` condition is true.
pub fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}
