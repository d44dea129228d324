use super::{Gateway, GatewayError, ResourceKind, ResourceRef, Tunnel};
use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment},
        core::v1::{ConfigMap, Pod, Secret, Service},
    },
    NamespaceResourceScope,
};
use kube_client::{
    api::{DeleteParams, ListParams, PostParams},
    Api, Client,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tokio::time::{self, Duration};

/// A [`Gateway`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    /// Recorded as the manager of every field this gateway creates.
    const FIELD_MANAGER: &'static str = "hubble-cli";
    const API_TIMEOUT: Duration = Duration::from_secs(10);

    /// Wraps a client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: kube_core::Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn get<K>(&self, ns: &str, name: &str) -> Result<Option<K>, GatewayError>
    where
        K: kube_core::Resource<Scope = NamespaceResourceScope>,
        K: Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        tracing::trace!(%ns, %name, kind = %std::any::type_name::<K>(), "Get");
        time::timeout(Self::API_TIMEOUT, self.api::<K>(ns).get_opt(name))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(Into::into)
    }

    async fn create<K>(&self, ns: &str, obj: K) -> Result<K, GatewayError>
    where
        K: kube_core::Resource<Scope = NamespaceResourceScope>,
        K: Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        tracing::debug!(%ns, name = ?kube_core::Resource::meta(&obj).name, "Create");
        let params = PostParams {
            field_manager: Some(Self::FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        time::timeout(Self::API_TIMEOUT, self.api::<K>(ns).create(&params, &obj))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(Into::into)
    }

    async fn delete_named<K>(&self, ns: &str, name: &str) -> Result<(), GatewayError>
    where
        K: kube_core::Resource<Scope = NamespaceResourceScope>,
        K: Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api = self.api::<K>(ns);
        time::timeout(
            Self::API_TIMEOUT,
            api.delete(name, &DeleteParams::background()),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;
        Ok(())
    }
}

impl std::fmt::Debug for KubeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeGateway")
            .field("field_manager", &Self::FIELD_MANAGER)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Gateway for KubeGateway {
    async fn daemon_set(&self, ns: &str, name: &str) -> Result<Option<DaemonSet>, GatewayError> {
        self.get(ns, name).await
    }

    async fn deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>, GatewayError> {
        self.get(ns, name).await
    }

    async fn service(&self, ns: &str, name: &str) -> Result<Option<Service>, GatewayError> {
        self.get(ns, name).await
    }

    async fn config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>, GatewayError> {
        self.get(ns, name).await
    }

    async fn secret(&self, ns: &str, name: &str) -> Result<Option<Secret>, GatewayError> {
        self.get(ns, name).await
    }

    async fn create_deployment(
        &self,
        ns: &str,
        deployment: Deployment,
    ) -> Result<Deployment, GatewayError> {
        self.create(ns, deployment).await
    }

    async fn create_service(&self, ns: &str, service: Service) -> Result<Service, GatewayError> {
        self.create(ns, service).await
    }

    async fn create_config_map(
        &self,
        ns: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap, GatewayError> {
        self.create(ns, config_map).await
    }

    async fn create_secret(&self, ns: &str, secret: Secret) -> Result<Secret, GatewayError> {
        self.create(ns, secret).await
    }

    async fn delete(&self, ns: &str, resource: &ResourceRef) -> Result<(), GatewayError> {
        tracing::debug!(%ns, %resource, "Delete");
        let name = resource.name.as_str();
        match resource.kind {
            ResourceKind::DaemonSet => self.delete_named::<DaemonSet>(ns, name).await,
            ResourceKind::Deployment => self.delete_named::<Deployment>(ns, name).await,
            ResourceKind::Service => self.delete_named::<Service>(ns, name).await,
            ResourceKind::ConfigMap => self.delete_named::<ConfigMap>(ns, name).await,
            ResourceKind::Secret => self.delete_named::<Secret>(ns, name).await,
        }
    }

    async fn pods(&self, ns: &str, selector: &str) -> Result<Vec<Pod>, GatewayError> {
        let params = ListParams::default().labels(selector);
        let list = time::timeout(Self::API_TIMEOUT, self.api::<Pod>(ns).list(&params))
            .await
            .map_err(|_| GatewayError::Timeout)??;
        Ok(list.items)
    }

    async fn tunnel(&self, ns: &str, pod: &str, port: u16) -> Result<Tunnel, GatewayError> {
        let mut forwarder = time::timeout(
            Self::API_TIMEOUT,
            self.api::<Pod>(ns).portforward(pod, &[port]),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| GatewayError::NoStream {
                pod: pod.to_string(),
                port,
            })?;

        // The forwarder drives the websocket; it completes once the stream is
        // closed on both ends.
        let pod = pod.to_string();
        tokio::spawn(async move {
            match forwarder.join().await {
                Ok(()) => tracing::trace!(%pod, port, "Tunnel closed"),
                Err(error) => tracing::debug!(%pod, port, %error, "Tunnel failed"),
            }
        });

        Ok(Box::new(stream))
    }
}
