//! Builders for the resources that make up the add-on
//!
//! Every object is fully determined by its parameters so that the reconciler
//! only ever needs to decide *whether* to create it.

use crate::config::EnableParams;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath,
            PodSpec, PodTemplateSpec, Probe, SecretVolumeSource, Service, ServicePort,
            ServiceSpec, TCPSocketAction, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use std::collections::BTreeMap;

/// The collector `DaemonSet` that must be ready before Hubble is deployed.
pub const COLLECTOR_NAME: &str = "cilium";

/// The CA secret shared by the collector and relay.
pub const CA_SECRET_NAME: &str = "cilium-ca";

/// Name of the relay's `Deployment` and `Service`.
pub const RELAY_NAME: &str = "hubble-relay";

/// Name of the relay's `ConfigMap`.
pub const RELAY_CONFIG_NAME: &str = "hubble-relay-config";

/// Name of the relay's client certificate `Secret`.
pub const RELAY_CLIENT_CERTS_NAME: &str = "hubble-relay-client-certs";

/// The port the relay container serves on.
pub const RELAY_CONTAINER_PORT: u16 = 4245;

/// The port the relay service exposes.
pub const RELAY_SERVICE_PORT: u16 = 80;

/// Name of the UI's `Deployment` and `Service`.
pub const UI_NAME: &str = "hubble-ui";

/// The port the UI frontend serves on.
pub const UI_CONTAINER_PORT: u16 = 8081;

/// The port the UI service exposes.
pub const UI_SERVICE_PORT: u16 = 80;

/// The UI frontend image.
pub const UI_IMAGE: &str = "quay.io/cilium/hubble-ui:v0.7.9";

/// The UI backend image.
pub const UI_BACKEND_IMAGE: &str = "quay.io/cilium/hubble-ui-backend:v0.7.9";

const UI_BACKEND_PORT: u16 = 8090;
const RELAY_CONFIG_FILE: &str = "config.yaml";
const RELAY_TLS_DIR: &str = "/var/lib/hubble-relay/tls";

/// Labels applied to every managed resource.
pub fn labels(app: &str) -> BTreeMap<String, String> {
    [
        ("k8s-app", app),
        ("app.kubernetes.io/part-of", "hubble"),
        ("app.kubernetes.io/managed-by", "hubble-cli"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn selector(app: &str) -> BTreeMap<String, String> {
    Some(("k8s-app".to_string(), app.to_string()))
        .into_iter()
        .collect()
}

fn metadata(ns: &str, name: &str, app: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        labels: Some(labels(app)),
        ..Default::default()
    }
}

/// The relay's configuration file.
pub fn relay_config_map(ns: &str) -> ConfigMap {
    let config = format!(
        "peer-service: hubble-peer.{ns}.svc.cluster.local:443\n\
         listen-address: :{RELAY_CONTAINER_PORT}\n\
         dial-timeout: 5s\n\
         retry-timeout: 30s\n\
         sort-buffer-len-max: 100\n\
         sort-buffer-drain-timeout: 1s\n\
         tls-client-cert-file: {RELAY_TLS_DIR}/client.crt\n\
         tls-client-key-file: {RELAY_TLS_DIR}/client.key\n\
         tls-hubble-server-ca-files: {RELAY_TLS_DIR}/hubble-server-ca.crt\n\
         disable-server-tls: true\n"
    );
    ConfigMap {
        metadata: metadata(ns, RELAY_CONFIG_NAME, RELAY_NAME),
        data: Some(Some((RELAY_CONFIG_FILE.to_string(), config)).into_iter().collect()),
        ..Default::default()
    }
}

/// The relay workload.
pub fn relay_deployment(params: &EnableParams) -> Deployment {
    let ns = params.namespace.as_str();
    let key_to_path = |key: &str, path: &str| KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        ..Default::default()
    };

    let container = Container {
        name: RELAY_NAME.to_string(),
        image: Some(params.relay_image_ref()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["hubble-relay".to_string()]),
        args: Some(vec![
            "serve".to_string(),
            format!("--config=/etc/hubble-relay/{RELAY_CONFIG_FILE}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("grpc".to_string()),
            container_port: RELAY_CONTAINER_PORT.into(),
            ..Default::default()
        }]),
        readiness_probe: Some(tcp_probe("grpc")),
        liveness_probe: Some(tcp_probe("grpc")),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: "/etc/hubble-relay".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "tls".to_string(),
                mount_path: RELAY_TLS_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: RELAY_CONFIG_NAME.to_string(),
                items: Some(vec![key_to_path(RELAY_CONFIG_FILE, RELAY_CONFIG_FILE)]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "tls".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(RELAY_CLIENT_CERTS_NAME.to_string()),
                items: Some(vec![
                    key_to_path("tls.crt", "client.crt"),
                    key_to_path("tls.key", "client.key"),
                    key_to_path("ca.crt", "hubble-server-ca.crt"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    deployment(ns, RELAY_NAME, vec![container], volumes)
}

/// Exposes the relay using the requested service type.
pub fn relay_service(params: &EnableParams) -> Service {
    service(
        &params.namespace,
        RELAY_NAME,
        params.relay_service_type.as_str(),
        RELAY_SERVICE_PORT,
        RELAY_CONTAINER_PORT,
    )
}

/// The in-cluster address UI backends use to reach the relay.
///
/// Returns `None` if the service does not expose any ports.
pub fn relay_address(ns: &str, relay: &Service) -> Option<String> {
    let port = relay.spec.as_ref()?.ports.as_ref()?.first()?.port;
    let name = relay.metadata.name.as_deref().unwrap_or(RELAY_NAME);
    Some(format!("{name}.{ns}.svc:{port}"))
}

/// The UI workload, configured to read flows from `relay_address`.
pub fn ui_deployment(ns: &str, relay_address: &str) -> Deployment {
    let frontend = Container {
        name: "frontend".to_string(),
        image: Some(UI_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: UI_CONTAINER_PORT.into(),
            ..Default::default()
        }]),
        readiness_probe: Some(tcp_probe("http")),
        ..Default::default()
    };

    let env = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };
    let backend = Container {
        name: "backend".to_string(),
        image: Some(UI_BACKEND_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![
            env("EVENTS_SERVER_PORT", UI_BACKEND_PORT.to_string()),
            env("FLOWS_API_ADDR", relay_address.to_string()),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("grpc".to_string()),
            container_port: UI_BACKEND_PORT.into(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    deployment(ns, UI_NAME, vec![frontend, backend], vec![])
}

/// Exposes the UI within the cluster.
pub fn ui_service(ns: &str) -> Service {
    service(ns, UI_NAME, "ClusterIP", UI_SERVICE_PORT, UI_CONTAINER_PORT)
}

fn deployment(ns: &str, name: &str, containers: Vec<Container>, volumes: Vec<Volume>) -> Deployment {
    Deployment {
        metadata: metadata(ns, name, name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(ns: &str, name: &str, type_: &str, port: u16, target_port: u16) -> Service {
    Service {
        metadata: metadata(ns, name, name),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            selector: Some(selector(name)),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: port.into(),
                target_port: Some(IntOrString::Int(target_port.into())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tcp_probe(port: &str) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(port.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    #[test]
    fn relay_service_uses_requested_type() {
        let params = EnableParams::default().with_relay_service_type(ServiceType::NodePort);
        let svc = relay_service(&params);
        let spec = svc.spec.expect("spec");
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.expect("ports")[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(4245)));
    }

    #[test]
    fn relay_deployment_uses_requested_image() {
        let params = EnableParams::default()
            .with_namespace("cilium")
            .with_relay_image("example.com/relay")
            .with_relay_version("v2");
        let deploy = relay_deployment(&params);
        assert_eq!(deploy.metadata.namespace.as_deref(), Some("cilium"));
        let pod = deploy.spec.expect("spec").template.spec.expect("pod spec");
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("example.com/relay:v2")
        );
    }

    #[test]
    fn ui_reads_from_relay_address() {
        let params = EnableParams::default();
        let relay = relay_service(&params);
        let addr = relay_address("kube-system", &relay).expect("address");
        assert_eq!(addr, "hubble-relay.kube-system.svc:80");

        let deploy = ui_deployment("kube-system", &addr);
        let pod = deploy.spec.expect("spec").template.spec.expect("pod spec");
        let env = pod.containers[1].env.as_ref().expect("env");
        assert!(env
            .iter()
            .any(|e| e.name == "FLOWS_API_ADDR" && e.value.as_deref() == Some(addr.as_str())));
    }

    #[test]
    fn labels_select_workloads() {
        let svc = ui_service("kube-system");
        let deploy = ui_deployment("kube-system", "relay:80");
        let template_labels = deploy
            .spec
            .expect("spec")
            .template
            .metadata
            .expect("metadata")
            .labels
            .expect("labels");
        for (k, v) in svc.spec.expect("spec").selector.expect("selector") {
            assert_eq!(template_labels.get(&k), Some(&v));
        }
    }
}
