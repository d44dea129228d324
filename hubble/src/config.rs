//! Per-invocation parameters for each operation
//!
//! Each command builds exactly one of these values from its defaults and the
//! operator's flags. They are never shared between invocations; in particular
//! the Kubernetes context is carried as a field rather than as process state.

use std::{fmt, time::Duration};

/// The namespace Cilium (and therefore Hubble) is installed in by default.
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// The default relay image repository.
pub const DEFAULT_RELAY_IMAGE: &str = "quay.io/cilium/hubble-relay";

/// The default relay image tag.
pub const DEFAULT_RELAY_VERSION: &str = "v1.9.5";

/// How long to wait for Cilium to become ready before deploying Hubble.
pub const DEFAULT_CILIUM_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Configures `enable`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnableParams {
    /// Namespace Cilium is running in.
    pub namespace: String,

    /// Whether the relay should be deployed.
    pub relay: bool,

    /// Image repository used for the relay.
    pub relay_image: String,

    /// Image tag used for the relay.
    pub relay_version: String,

    /// How the relay is exposed.
    pub relay_service_type: ServiceType,

    /// Whether the UI should be deployed.
    pub ui: bool,

    /// Whether a missing CA may be generated.
    pub create_ca: bool,

    /// Kubernetes configuration context.
    pub context: Option<String>,

    /// Bounds every readiness wait in the invocation.
    pub cilium_ready_timeout: Duration,
}

/// Configures `disable`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisableParams {
    /// Namespace Cilium is running in.
    pub namespace: String,

    /// Kubernetes configuration context.
    pub context: Option<String>,
}

/// Configures `port-forward` and `ui`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardParams {
    /// Namespace Cilium is running in.
    pub namespace: String,

    /// Kubernetes configuration context.
    pub context: Option<String>,

    /// The in-cluster endpoint to expose.
    pub target: ForwardTarget,

    /// The local port to listen on. Zero selects an ephemeral port.
    pub local_port: u16,
}

/// The in-cluster endpoints a forwarding session can expose.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ForwardTarget {
    /// The relay's flow query API.
    Relay,

    /// The UI's web frontend.
    Ui,
}

/// The Kubernetes service type used to expose the relay.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// Reachable only from within the cluster.
    #[default]
    ClusterIp,

    /// Exposed on every node's address.
    NodePort,

    /// Exposed through an external load balancer.
    LoadBalancer,
}

/// Indicates that a set of parameters can never be satisfied.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidParams {
    /// The UI was requested without the relay it reads flows from.
    #[error("the UI cannot be enabled without the relay")]
    UiRequiresRelay,

    /// No namespace was given.
    #[error("namespace must not be empty")]
    EmptyNamespace,
}

/// Indicates that an unknown service type was specified.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid service type: {0} must be 'ClusterIP', 'NodePort' or 'LoadBalancer'")]
pub struct InvalidServiceType(String);

// === impl EnableParams ===

impl Default for EnableParams {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            relay: true,
            relay_image: DEFAULT_RELAY_IMAGE.to_string(),
            relay_version: DEFAULT_RELAY_VERSION.to_string(),
            relay_service_type: ServiceType::default(),
            ui: false,
            create_ca: false,
            context: None,
            cilium_ready_timeout: DEFAULT_CILIUM_READY_TIMEOUT,
        }
    }
}

impl EnableParams {
    /// Overrides the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets whether the relay is deployed.
    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    /// Overrides the relay image repository.
    pub fn with_relay_image(mut self, image: impl Into<String>) -> Self {
        self.relay_image = image.into();
        self
    }

    /// Overrides the relay image tag.
    pub fn with_relay_version(mut self, version: impl Into<String>) -> Self {
        self.relay_version = version.into();
        self
    }

    /// Overrides how the relay is exposed.
    pub fn with_relay_service_type(mut self, service_type: ServiceType) -> Self {
        self.relay_service_type = service_type;
        self
    }

    /// Sets whether the UI is deployed.
    pub fn with_ui(mut self, ui: bool) -> Self {
        self.ui = ui;
        self
    }

    /// Sets whether a missing CA may be generated.
    pub fn with_create_ca(mut self, create_ca: bool) -> Self {
        self.create_ca = create_ca;
        self
    }

    /// Selects a Kubernetes configuration context.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Overrides the readiness timeout.
    pub fn with_cilium_ready_timeout(mut self, timeout: Duration) -> Self {
        self.cilium_ready_timeout = timeout;
        self
    }

    /// The fully qualified relay image reference.
    pub fn relay_image_ref(&self) -> String {
        format!("{}:{}", self.relay_image, self.relay_version)
    }

    /// Rejects combinations that cannot be reconciled.
    pub fn validate(&self) -> Result<(), InvalidParams> {
        if self.namespace.is_empty() {
            return Err(InvalidParams::EmptyNamespace);
        }
        if self.ui && !self.relay {
            return Err(InvalidParams::UiRequiresRelay);
        }
        Ok(())
    }
}

// === impl DisableParams ===

impl Default for DisableParams {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            context: None,
        }
    }
}

impl DisableParams {
    /// Overrides the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Selects a Kubernetes configuration context.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }
}

// === impl ForwardParams ===

impl ForwardParams {
    /// Forwards the relay on its default local port.
    pub fn relay() -> Self {
        Self::for_target(ForwardTarget::Relay)
    }

    /// Forwards the UI on its default local port.
    pub fn ui() -> Self {
        Self::for_target(ForwardTarget::Ui)
    }

    fn for_target(target: ForwardTarget) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            context: None,
            target,
            local_port: target.default_local_port(),
        }
    }

    /// Overrides the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Selects a Kubernetes configuration context.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Overrides the local port.
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }
}

// === impl ForwardTarget ===

impl ForwardTarget {
    /// The service fronting the endpoint.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Relay => crate::manifests::RELAY_NAME,
            Self::Ui => crate::manifests::UI_NAME,
        }
    }

    /// The service port to forward to.
    pub fn remote_port(&self) -> u16 {
        match self {
            Self::Relay => crate::manifests::RELAY_SERVICE_PORT,
            Self::Ui => crate::manifests::UI_SERVICE_PORT,
        }
    }

    /// The local port used when none is given.
    pub fn default_local_port(&self) -> u16 {
        match self {
            Self::Relay => 4245,
            Self::Ui => 12000,
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Ui => f.write_str("ui"),
        }
    }
}

// === impl ServiceType ===

impl ServiceType {
    /// The value of a Service's `spec.type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = InvalidServiceType;

    fn from_str(s: &str) -> Result<Self, InvalidServiceType> {
        match s {
            "ClusterIP" => Ok(Self::ClusterIp),
            "NodePort" => Ok(Self::NodePort),
            "LoadBalancer" => Ok(Self::LoadBalancer),
            s => Err(InvalidServiceType(s.to_string())),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
