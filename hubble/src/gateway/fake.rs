//! An in-memory [`Gateway`] for tests.
//!
//! Workloads become ready at configurable offsets from the moment the fake was
//! constructed, so tests drive readiness with tokio's paused clock.

use super::{Gateway, GatewayError, ResourceKind, ResourceRef, Tunnel};
use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetStatus, Deployment, DeploymentStatus},
        core::v1::{
            ConfigMap, Pod, PodCondition, PodStatus, Secret, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::time::{Duration, Instant};

#[derive(Clone, Debug)]
enum Object {
    DaemonSet(DaemonSet),
    Deployment(Deployment),
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
}

type Key = (String, ResourceKind, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Object>,
    pods: BTreeMap<(String, String), Pod>,
    ready_after: HashMap<(ResourceKind, String), Option<Duration>>,
    get_failures: HashMap<(ResourceKind, String), (u16, usize)>,
    create_failures: HashMap<(ResourceKind, String), u16>,
    delete_failures: HashMap<(ResourceKind, String), u16>,
    stalls: HashMap<(ResourceKind, String), Duration>,
    refuse_tunnels: bool,
    stall_tunnels: bool,
}

pub(crate) struct FakeGateway {
    epoch: Instant,
    state: Mutex<State>,
    calls: AtomicUsize,
    mutations: AtomicUsize,
    tunnels: AtomicUsize,
}

pub(crate) fn api_error(code: u16) -> GatewayError {
    GatewayError::Api(kube_client::Error::Api(kube_core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {code}"),
        reason: "Injected".to_string(),
        code,
    }))
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        ..Default::default()
    }
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(State::default()),
            calls: AtomicUsize::new(0),
            mutations: AtomicUsize::new(0),
            tunnels: AtomicUsize::new(0),
        }
    }

    /// Adds the collector agent set, ready after `delay` (or never).
    pub(crate) fn with_collector(self, ns: &str, delay: Option<Duration>) -> Self {
        let name = crate::manifests::COLLECTOR_NAME;
        let ds = DaemonSet {
            metadata: meta(ns, name),
            ..Default::default()
        };
        {
            let mut state = self.state.lock();
            state.objects.insert(
                (ns.to_string(), ResourceKind::DaemonSet, name.to_string()),
                Object::DaemonSet(ds),
            );
            state
                .ready_after
                .insert((ResourceKind::DaemonSet, name.to_string()), delay);
        }
        self
    }

    /// Sets when a workload becomes ready, relative to construction.
    pub(crate) fn ready_after(&self, kind: ResourceKind, name: &str, delay: Option<Duration>) {
        self.state
            .lock()
            .ready_after
            .insert((kind, name.to_string()), delay);
    }

    /// Fails the next `times` reads of a resource with `code`.
    pub(crate) fn fail_gets(&self, kind: ResourceKind, name: &str, code: u16, times: usize) {
        self.state
            .lock()
            .get_failures
            .insert((kind, name.to_string()), (code, times));
    }

    /// Delays every read of a resource by `delay`.
    pub(crate) fn stall_gets(&self, kind: ResourceKind, name: &str, delay: Duration) {
        self.state
            .lock()
            .stalls
            .insert((kind, name.to_string()), delay);
    }

    pub(crate) fn fail_create(&self, kind: ResourceKind, name: &str, code: u16) {
        self.state
            .lock()
            .create_failures
            .insert((kind, name.to_string()), code);
    }

    pub(crate) fn fail_delete(&self, kind: ResourceKind, name: &str, code: u16) {
        self.state
            .lock()
            .delete_failures
            .insert((kind, name.to_string()), code);
    }

    pub(crate) fn refuse_tunnels(&self, refuse: bool) {
        self.state.lock().refuse_tunnels = refuse;
    }

    /// Tunnels that are opened while stalled never complete.
    pub(crate) fn stall_tunnels(&self, stall: bool) {
        self.state.lock().stall_tunnels = stall;
    }

    pub(crate) fn insert_secret(&self, ns: &str, secret: Secret) {
        let name = name_of(&secret.metadata);
        self.state.lock().objects.insert(
            (ns.to_string(), ResourceKind::Secret, name),
            Object::Secret(secret),
        );
    }

    /// Adds a service selecting `k8s-app=<name>` that targets `target_port`.
    pub(crate) fn insert_service(&self, ns: &str, name: &str, port: i32, target_port: i32) {
        let svc = Service {
            metadata: meta(ns, name),
            spec: Some(ServiceSpec {
                selector: Some([("k8s-app".to_string(), name.to_string())].into()),
                ports: Some(vec![ServicePort {
                    port,
                    target_port: Some(IntOrString::Int(target_port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state.lock().objects.insert(
            (ns.to_string(), ResourceKind::Service, name.to_string()),
            Object::Service(svc),
        );
    }

    /// Adds a pod labeled as part of `app`.
    pub(crate) fn insert_pod(&self, ns: &str, name: &str, app: &str, ready: bool) {
        let pod = Pod {
            metadata: ObjectMeta {
                labels: Some(crate::manifests::labels(app)),
                ..meta(ns, name)
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state
            .lock()
            .pods
            .insert((ns.to_string(), name.to_string()), pod);
    }

    pub(crate) fn remove_pods(&self, ns: &str) {
        self.state.lock().pods.retain(|(n, _), _| n != ns);
    }

    pub(crate) fn contains(&self, ns: &str, kind: ResourceKind, name: &str) -> bool {
        self.state
            .lock()
            .objects
            .contains_key(&(ns.to_string(), kind, name.to_string()))
    }

    pub(crate) fn count(&self, ns: &str, kind: ResourceKind) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(n, k, _)| n == ns && *k == kind)
            .count()
    }

    /// Every resource currently stored, as `kind/name`.
    pub(crate) fn resources(&self, ns: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(n, _, _)| n == ns)
            .map(|(_, kind, name)| format!("{kind}/{name}"))
            .collect()
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub(crate) fn tunnels(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    /// Records a call and gives other tasks a chance to interleave.
    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }

    async fn read(
        &self,
        ns: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<Object>, GatewayError> {
        self.enter().await;
        let stall = {
            let mut state = self.state.lock();
            let key = (kind, name.to_string());
            if let Some((code, remaining)) = state.get_failures.get_mut(&key) {
                let code = *code;
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    state.get_failures.remove(&key);
                }
                return Err(api_error(code));
            }
            state.stalls.get(&key).copied()
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(self.get(ns, kind, name))
    }

    fn is_ready(&self, state: &State, kind: ResourceKind, name: &str) -> bool {
        match state.ready_after.get(&(kind, name.to_string())) {
            None => true,
            Some(None) => false,
            Some(Some(delay)) => Instant::now() >= self.epoch + *delay,
        }
    }

    fn get(&self, ns: &str, kind: ResourceKind, name: &str) -> Option<Object> {
        let state = self.state.lock();
        let obj = state
            .objects
            .get(&(ns.to_string(), kind, name.to_string()))
            .cloned()?;
        let ready = self.is_ready(&state, kind, name);
        Some(match obj {
            Object::DaemonSet(mut ds) => {
                ds.status = Some(DaemonSetStatus {
                    desired_number_scheduled: 3,
                    number_ready: if ready { 3 } else { 0 },
                    ..Default::default()
                });
                Object::DaemonSet(ds)
            }
            Object::Deployment(mut deploy) => {
                deploy.status = Some(DeploymentStatus {
                    ready_replicas: ready.then_some(1),
                    ..Default::default()
                });
                Object::Deployment(deploy)
            }
            obj => obj,
        })
    }

    fn create(
        &self,
        ns: &str,
        kind: ResourceKind,
        meta: &ObjectMeta,
        obj: Object,
    ) -> Result<(), GatewayError> {
        let name = name_of(meta);
        let mut state = self.state.lock();
        if let Some(code) = state.create_failures.get(&(kind, name.clone())) {
            return Err(api_error(*code));
        }
        let key = (ns.to_string(), kind, name);
        if state.objects.contains_key(&key) {
            return Err(api_error(409));
        }
        state.objects.insert(key, obj);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn daemon_set(&self, ns: &str, name: &str) -> Result<Option<DaemonSet>, GatewayError> {
        Ok(match self.read(ns, ResourceKind::DaemonSet, name).await? {
            Some(Object::DaemonSet(ds)) => Some(ds),
            _ => None,
        })
    }

    async fn deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>, GatewayError> {
        Ok(match self.read(ns, ResourceKind::Deployment, name).await? {
            Some(Object::Deployment(d)) => Some(d),
            _ => None,
        })
    }

    async fn service(&self, ns: &str, name: &str) -> Result<Option<Service>, GatewayError> {
        Ok(match self.read(ns, ResourceKind::Service, name).await? {
            Some(Object::Service(s)) => Some(s),
            _ => None,
        })
    }

    async fn config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>, GatewayError> {
        Ok(match self.read(ns, ResourceKind::ConfigMap, name).await? {
            Some(Object::ConfigMap(c)) => Some(c),
            _ => None,
        })
    }

    async fn secret(&self, ns: &str, name: &str) -> Result<Option<Secret>, GatewayError> {
        Ok(match self.read(ns, ResourceKind::Secret, name).await? {
            Some(Object::Secret(s)) => Some(s),
            _ => None,
        })
    }

    async fn create_deployment(
        &self,
        ns: &str,
        deployment: Deployment,
    ) -> Result<Deployment, GatewayError> {
        self.enter().await;
        let meta = deployment.metadata.clone();
        self.create(
            ns,
            ResourceKind::Deployment,
            &meta,
            Object::Deployment(deployment.clone()),
        )?;
        Ok(deployment)
    }

    async fn create_service(&self, ns: &str, service: Service) -> Result<Service, GatewayError> {
        self.enter().await;
        let meta = service.metadata.clone();
        self.create(ns, ResourceKind::Service, &meta, Object::Service(service.clone()))?;
        Ok(service)
    }

    async fn create_config_map(
        &self,
        ns: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap, GatewayError> {
        self.enter().await;
        let meta = config_map.metadata.clone();
        self.create(
            ns,
            ResourceKind::ConfigMap,
            &meta,
            Object::ConfigMap(config_map.clone()),
        )?;
        Ok(config_map)
    }

    async fn create_secret(&self, ns: &str, secret: Secret) -> Result<Secret, GatewayError> {
        self.enter().await;
        let meta = secret.metadata.clone();
        self.create(ns, ResourceKind::Secret, &meta, Object::Secret(secret.clone()))?;
        Ok(secret)
    }

    async fn delete(&self, ns: &str, resource: &ResourceRef) -> Result<(), GatewayError> {
        self.enter().await;
        let mut state = self.state.lock();
        if let Some(code) = state
            .delete_failures
            .get(&(resource.kind, resource.name.clone()))
        {
            return Err(api_error(*code));
        }
        let key = (ns.to_string(), resource.kind, resource.name.clone());
        match state.objects.remove(&key) {
            Some(_) => {
                self.mutations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(api_error(404)),
        }
    }

    async fn pods(&self, ns: &str, selector: &str) -> Result<Vec<Pod>, GatewayError> {
        self.enter().await;
        let wanted = selector
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .collect::<Vec<_>>();
        let state = self.state.lock();
        Ok(state
            .pods
            .iter()
            .filter(|((n, _), _)| n == ns)
            .map(|(_, pod)| pod)
            .filter(|pod| {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn tunnel(&self, ns: &str, pod: &str, port: u16) -> Result<Tunnel, GatewayError> {
        self.enter().await;
        let stalled = {
            let state = self.state.lock();
            let exists = state.pods.contains_key(&(ns.to_string(), pod.to_string()));
            if state.refuse_tunnels || !exists {
                return Err(GatewayError::NoStream {
                    pod: pod.to_string(),
                    port,
                });
            }
            state.stall_tunnels
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        self.tunnels.fetch_add(1, Ordering::SeqCst);

        // The pod end echoes everything it reads.
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut rx, &mut tx).await;
        });
        Ok(Box::new(client))
    }
}
