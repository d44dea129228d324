//! The cluster operations Hubble's lifecycle depends on
//!
//! [`Gateway`] is deliberately narrow: typed get/create/delete for the handful
//! of resource kinds the add-on consists of, pod discovery, and a byte tunnel
//! to a pod port. Readiness is derived by callers from the objects returned
//! here, so that polling and deadlines stay under the reconciler's control.

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{ConfigMap, Pod, Secret, Service},
};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

mod kube;

#[cfg(test)]
pub(crate) mod fake;

pub use self::kube::KubeGateway;

/// A bidirectional byte stream to a pod port.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// An established tunnel.
pub type Tunnel = Box<dyn Io>;

/// Resource kinds managed by the add-on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// `apps/v1` `DaemonSet`
    DaemonSet,

    /// `apps/v1` `Deployment`
    Deployment,

    /// `v1` `Service`
    Service,

    /// `v1` `ConfigMap`
    ConfigMap,

    /// `v1` `Secret`
    Secret,
}

/// Names a single namespaced resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// The resource's kind.
    pub kind: ResourceKind,

    /// The resource's name.
    pub name: String,
}

/// Indicates an error interacting with the cluster
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// An error was received from the Kubernetes API
    #[error("kubernetes API request failed: {0}")]
    Api(#[from] kube_client::Error),

    /// A Kubernetes API call timed out
    #[error("kubernetes API request timed out")]
    Timeout,

    /// A tunnel was set up but did not yield a stream
    #[error("no stream for {pod}:{port}")]
    NoStream {
        /// The pod the tunnel targets.
        pod: String,

        /// The pod port the tunnel targets.
        port: u16,
    },
}

/// Reads, writes and tunnels to the resources that make up the add-on.
///
/// All operations are namespaced. Getters return `Ok(None)` when the resource
/// does not exist; every other failure is an error.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Gets a `DaemonSet`.
    async fn daemon_set(&self, ns: &str, name: &str) -> Result<Option<DaemonSet>, GatewayError>;

    /// Gets a `Deployment`.
    async fn deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>, GatewayError>;

    /// Gets a `Service`.
    async fn service(&self, ns: &str, name: &str) -> Result<Option<Service>, GatewayError>;

    /// Gets a `ConfigMap`.
    async fn config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>, GatewayError>;

    /// Gets a `Secret`.
    async fn secret(&self, ns: &str, name: &str) -> Result<Option<Secret>, GatewayError>;

    /// Creates a `Deployment`, failing with a conflict if it already exists.
    async fn create_deployment(
        &self,
        ns: &str,
        deployment: Deployment,
    ) -> Result<Deployment, GatewayError>;

    /// Creates a `Service`, failing with a conflict if it already exists.
    async fn create_service(&self, ns: &str, service: Service) -> Result<Service, GatewayError>;

    /// Creates a `ConfigMap`, failing with a conflict if it already exists.
    async fn create_config_map(
        &self,
        ns: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap, GatewayError>;

    /// Creates a `Secret`, failing with a conflict if it already exists.
    async fn create_secret(&self, ns: &str, secret: Secret) -> Result<Secret, GatewayError>;

    /// Deletes a resource. A missing resource is reported as a not-found error.
    async fn delete(&self, ns: &str, resource: &ResourceRef) -> Result<(), GatewayError>;

    /// Lists pods matching a label selector.
    async fn pods(&self, ns: &str, selector: &str) -> Result<Vec<Pod>, GatewayError>;

    /// Opens a byte tunnel to a port on a pod.
    async fn tunnel(&self, ns: &str, pod: &str, port: u16) -> Result<Tunnel, GatewayError>;
}

// === impl ResourceKind ===

impl ResourceKind {
    /// The lowercase kind name, as used by `kubectl`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DaemonSet => "daemonset",
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceRef ===

impl ResourceRef {
    /// Refers to a resource by kind and name.
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// === impl GatewayError ===

impl GatewayError {
    /// The HTTP status of an API error response, if any.
    pub fn status(&self) -> Option<hyper::StatusCode> {
        match self {
            Self::Api(kube_client::Error::Api(kube_core::ErrorResponse { code, .. })) => {
                hyper::StatusCode::from_u16(*code).ok()
            }
            _ => None,
        }
    }

    /// Returns true if the API reported that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(hyper::StatusCode::NOT_FOUND)
    }

    /// Returns true if the API reported that the resource already exists or
    /// was concurrently modified.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(hyper::StatusCode::CONFLICT)
    }

    /// Returns true if the caller is not permitted to perform the request.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self.status(),
            Some(hyper::StatusCode::FORBIDDEN | hyper::StatusCode::UNAUTHORIZED)
        )
    }
}
