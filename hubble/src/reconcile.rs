//! Drives the add-on's resources toward the requested state
//!
//! [`Reconciler::enable`] observes what exists, creates only what is missing,
//! and gates each step on the readiness of the step before it: the collector
//! must be ready before the relay is deployed, and the relay must be ready
//! before the UI is configured to read from it. Every readiness wait in one
//! invocation shares a single deadline.
//!
//! [`Reconciler::disable`] removes everything except the CA, which is kept so
//! that clients trusting it continue to work after a later enable.

use crate::{
    config::{DisableParams, EnableParams, InvalidParams},
    credentials::{self, CredentialError},
    gateway::{Gateway, GatewayError, ResourceKind, ResourceRef},
    manifests,
    state::{self, AddOnState, Workload},
};
use std::{fmt, future::Future, sync::Arc};
use tokio::time::{self, Duration, Instant};


/// Applies enable and disable operations through a [`Gateway`].
#[derive(Clone)]
pub struct Reconciler {
    gateway: Arc<dyn Gateway>,
}

/// The independently deployable parts of the add-on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    /// The flow aggregation and query service.
    Relay,

    /// The web UI.
    Ui,
}

/// The lifecycle phase of a component within one invocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Not installed.
    Absent,

    /// Resources are being created.
    Creating,

    /// All resources exist; waiting for the workload to become ready.
    WaitingReady,

    /// Installed and ready.
    Ready,

    /// Resources are being deleted.
    Deleting,

    /// A create or delete failed.
    Failed,

    /// The workload did not become ready before the deadline.
    TimedOut,
}

/// Indicates that a phase change is not permitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// The current phase.
    pub from: Phase,

    /// The requested phase.
    pub to: Phase,
}

/// Describes the result of a successful enable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnableReport {
    /// The relay's final phase.
    pub relay: Phase,

    /// The UI's final phase.
    pub ui: Phase,

    /// Whether a CA was generated by this invocation.
    pub ca_created: bool,

    /// Resources created by this invocation, in creation order.
    pub created: Vec<ResourceRef>,
}

/// Describes the result of a successful disable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisableReport {
    /// Resources deleted by this invocation.
    pub deleted: Vec<ResourceRef>,

    /// Resources that did not exist.
    pub absent: Vec<ResourceRef>,
}

/// Indicates that enable did not complete
#[derive(Debug, thiserror::Error)]
pub enum EnableError {
    /// The UI was requested without the relay
    #[error("the UI cannot be enabled without the relay")]
    UiRequiresRelay,

    /// The parameters are otherwise invalid
    #[error(transparent)]
    InvalidParams(InvalidParams),

    /// The collector did not become ready before the deadline
    #[error("{resource} was not ready within {timeout:?}")]
    PrerequisiteNotReady {
        /// The prerequisite workload.
        resource: ResourceRef,

        /// The configured timeout.
        timeout: Duration,
    },

    /// Credentials could not be provisioned
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// A component did not become ready before the deadline
    #[error("{component} was not ready within {timeout:?}")]
    ReadinessTimeout {
        /// The component that was awaited.
        component: Component,

        /// The configured timeout.
        timeout: Duration,
    },

    /// A resource could not be created
    #[error("failed to create {resource}: {source}")]
    Create {
        /// The resource that was being created.
        resource: ResourceRef,

        /// The underlying failure.
        #[source]
        source: GatewayError,
    },

    /// The relay service does not expose an address the UI can use
    #[error("{0} exposes no port")]
    RelayAddress(ResourceRef),

    /// Some components were enabled before another failed
    #[error("{failed} could not be enabled ({} ready): {source}", ComponentList(.ready))]
    PartialEnableFailure {
        /// Components that were left installed and ready.
        ready: Vec<Component>,

        /// The component that failed.
        failed: Component,

        /// Why it failed.
        #[source]
        source: Box<EnableError>,
    },

    /// The cluster could not be read
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Shutdown was signaled while waiting
    #[error("cancelled")]
    Cancelled,
}

/// Indicates that disable left resources behind
#[derive(Debug, thiserror::Error)]
pub enum DisableError {
    /// One or more deletes failed; every resource was attempted
    #[error("failed to delete {}", FailureList(.failures))]
    AggregateDeleteFailure {
        /// Each resource that could not be deleted, with its cause.
        failures: Vec<DeleteFailure>,

        /// Resources that were deleted despite the failures.
        report: DisableReport,
    },
}

/// A resource that could not be deleted.
#[derive(Debug)]
pub struct DeleteFailure {
    /// The resource.
    pub resource: ResourceRef,

    /// The failure.
    pub source: GatewayError,
}

/// The outcome of a readiness wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Wait {
    Ready,
    Expired,
    Cancelled,
}

/// Tracks a component through its phases, logging each change.
#[derive(Debug)]
struct Progress {
    component: Component,
    phase: Phase,
}

const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_MAX: Duration = Duration::from_secs(2);

// === impl Reconciler ===

impl Reconciler {
    /// Reconciles through `gateway`.
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Installs the requested components, creating only what is missing.
    ///
    /// Returns [`EnableError::Cancelled`] if `shutdown` is signaled during a
    /// readiness wait. Resources created before cancellation are left in
    /// place.
    pub async fn enable(
        &self,
        params: &EnableParams,
        shutdown: drain::Watch,
    ) -> Result<EnableReport, EnableError> {
        params.validate()?;

        let ns = params.namespace.as_str();
        let timeout = params.cilium_ready_timeout;
        let deadline = Instant::now() + timeout;
        tracing::debug!(%ns, ?timeout, relay = params.relay, ui = params.ui, "Enabling");

        let state = AddOnState::observe(&*self.gateway, ns).await?;
        let collector = ResourceRef::new(ResourceKind::DaemonSet, manifests::COLLECTOR_NAME);
        if !state.collector.ready {
            match self.wait_ready(ns, &collector, deadline, &shutdown).await? {
                Wait::Ready => {}
                Wait::Expired => {
                    return Err(EnableError::PrerequisiteNotReady {
                        resource: collector,
                        timeout,
                    })
                }
                Wait::Cancelled => return Err(EnableError::Cancelled),
            }
        }
        tracing::debug!(%collector, "Ready");

        let mut relay = Progress::observed(
            Component::Relay,
            state.relay,
            state.missing_relay().is_empty(),
        );
        let mut ui = Progress::observed(Component::Ui, state.ui, state.missing_ui().is_empty());
        let mut report = EnableReport {
            relay: relay.phase,
            ui: ui.phase,
            ca_created: false,
            created: Vec::new(),
        };

        if params.relay {
            let res = self
                .enable_relay(params, &state, &mut relay, deadline, &shutdown, &mut report)
                .await;
            report.relay = relay.phase;
            res?;
        }

        if params.ui {
            let res = self
                .enable_ui(params, &state, &mut ui, deadline, &shutdown, &mut report)
                .await;
            report.ui = ui.phase;
            match res {
                Ok(()) => {}
                Err(EnableError::Cancelled) => return Err(EnableError::Cancelled),
                // The relay is ready and is left installed.
                Err(error) => {
                    return Err(EnableError::PartialEnableFailure {
                        ready: vec![Component::Relay],
                        failed: Component::Ui,
                        source: Box::new(error),
                    })
                }
            }
        }

        tracing::info!(%ns, relay = %report.relay, ui = %report.ui, created = report.created.len(), "Enabled");
        Ok(report)
    }

    async fn enable_relay(
        &self,
        params: &EnableParams,
        state: &AddOnState,
        relay: &mut Progress,
        deadline: Instant,
        shutdown: &drain::Watch,
        report: &mut EnableReport,
    ) -> Result<(), EnableError> {
        let ns = params.namespace.as_str();
        let gateway = &*self.gateway;

        if relay.phase == Phase::Absent {
            relay.advance(Phase::Creating);
            let created = async {
                let ca = credentials::ensure_ca(gateway, ns, params.create_ca).await?;
                report.ca_created = ca.created();
                if ca.created() {
                    report.created.push(ResourceRef::new(
                        ResourceKind::Secret,
                        manifests::CA_SECRET_NAME,
                    ));
                }

                let leaf = credentials::relay_client_leaf();
                if credentials::ensure_leaf(gateway, ns, &ca, &leaf).await? {
                    report
                        .created
                        .push(ResourceRef::new(ResourceKind::Secret, leaf.secret_name));
                }

                if !state.relay_config {
                    let resource =
                        ResourceRef::new(ResourceKind::ConfigMap, manifests::RELAY_CONFIG_NAME);
                    let config = manifests::relay_config_map(ns);
                    create(resource, gateway.create_config_map(ns, config), report).await?;
                }
                if !state.relay.exists {
                    let resource = ResourceRef::new(ResourceKind::Deployment, manifests::RELAY_NAME);
                    let deploy = manifests::relay_deployment(params);
                    create(resource, gateway.create_deployment(ns, deploy), report).await?;
                }
                if !state.relay_service {
                    let resource = ResourceRef::new(ResourceKind::Service, manifests::RELAY_NAME);
                    let svc = manifests::relay_service(params);
                    create(resource, gateway.create_service(ns, svc), report).await?;
                }
                Ok::<_, EnableError>(())
            }
            .await;
            if let Err(error) = created {
                relay.advance(Phase::Failed);
                return Err(error);
            }
            relay.advance(Phase::WaitingReady);
        }

        self.await_component(ns, relay, deadline, params.cilium_ready_timeout, shutdown)
            .await
    }

    async fn enable_ui(
        &self,
        params: &EnableParams,
        state: &AddOnState,
        ui: &mut Progress,
        deadline: Instant,
        shutdown: &drain::Watch,
        report: &mut EnableReport,
    ) -> Result<(), EnableError> {
        let ns = params.namespace.as_str();
        let gateway = &*self.gateway;

        if ui.phase == Phase::Absent {
            ui.advance(Phase::Creating);
            let created = async {
                let relay_svc = ResourceRef::new(ResourceKind::Service, manifests::RELAY_NAME);
                let address = gateway
                    .service(ns, manifests::RELAY_NAME)
                    .await?
                    .and_then(|svc| manifests::relay_address(ns, &svc))
                    .ok_or_else(|| EnableError::RelayAddress(relay_svc))?;
                tracing::debug!(%address, "Configuring UI");

                if !state.ui.exists {
                    let resource = ResourceRef::new(ResourceKind::Deployment, manifests::UI_NAME);
                    let deploy = manifests::ui_deployment(ns, &address);
                    create(resource, gateway.create_deployment(ns, deploy), report).await?;
                }
                if !state.ui_service {
                    let resource = ResourceRef::new(ResourceKind::Service, manifests::UI_NAME);
                    let svc = manifests::ui_service(ns);
                    create(resource, gateway.create_service(ns, svc), report).await?;
                }
                Ok::<_, EnableError>(())
            }
            .await;
            if let Err(error) = created {
                ui.advance(Phase::Failed);
                return Err(error);
            }
            ui.advance(Phase::WaitingReady);
        }

        self.await_component(ns, ui, deadline, params.cilium_ready_timeout, shutdown)
            .await
    }

    /// Waits for a component in `WaitingReady` to become ready.
    async fn await_component(
        &self,
        ns: &str,
        progress: &mut Progress,
        deadline: Instant,
        timeout: Duration,
        shutdown: &drain::Watch,
    ) -> Result<(), EnableError> {
        if progress.phase != Phase::WaitingReady {
            return Ok(());
        }

        let workload = ResourceRef::new(ResourceKind::Deployment, progress.component.name());
        match self.wait_ready(ns, &workload, deadline, shutdown).await? {
            Wait::Ready => {
                progress.advance(Phase::Ready);
                Ok(())
            }
            Wait::Expired => {
                progress.advance(Phase::TimedOut);
                Err(EnableError::ReadinessTimeout {
                    component: progress.component,
                    timeout,
                })
            }
            Wait::Cancelled => Err(EnableError::Cancelled),
        }
    }

    /// Polls a workload until it is ready, the deadline passes, or shutdown
    /// is signaled.
    ///
    /// Each check is bounded by the deadline. Failed checks are retried
    /// unless the caller is not permitted to read the workload.
    async fn wait_ready(
        &self,
        ns: &str,
        workload: &ResourceRef,
        deadline: Instant,
        shutdown: &drain::Watch,
    ) -> Result<Wait, GatewayError> {
        let cancelled = shutdown.clone().signaled();
        tokio::pin!(cancelled);

        let mut delay = POLL_INITIAL;
        loop {
            let checked = tokio::select! {
                biased;
                _ = &mut cancelled => return Ok(Wait::Cancelled),
                res = time::timeout_at(deadline, self.is_ready(ns, workload)) => res,
            };
            match checked {
                Ok(Ok(true)) => return Ok(Wait::Ready),
                Ok(Ok(false)) => tracing::trace!(%workload, ?delay, "Not ready"),
                Ok(Err(error)) if error.is_forbidden() => return Err(error),
                Ok(Err(error)) => tracing::debug!(%workload, %error, "Readiness check failed"),
                Err(_) => {
                    tracing::debug!(%workload, "Deadline elapsed during readiness check");
                    return Ok(Wait::Expired);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(%workload, "Deadline elapsed");
                return Ok(Wait::Expired);
            }

            tokio::select! {
                biased;
                _ = &mut cancelled => return Ok(Wait::Cancelled),
                _ = time::sleep_until(deadline.min(now + delay)) => {}
            }
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    async fn is_ready(&self, ns: &str, workload: &ResourceRef) -> Result<bool, GatewayError> {
        let name = workload.name.as_str();
        Ok(match workload.kind {
            ResourceKind::DaemonSet => self
                .gateway
                .daemon_set(ns, name)
                .await?
                .is_some_and(|ds| state::daemon_set_ready(&ds)),
            ResourceKind::Deployment => self
                .gateway
                .deployment(ns, name)
                .await?
                .is_some_and(|d| state::deployment_ready(&d)),
            ResourceKind::Service | ResourceKind::ConfigMap | ResourceKind::Secret => true,
        })
    }

    /// Removes every managed resource except the CA.
    ///
    /// Every resource is attempted even after a failure, and nothing is read
    /// beforehand. Resources that do not exist are not errors.
    pub async fn disable(&self, params: &DisableParams) -> Result<DisableReport, DisableError> {
        let ns = params.namespace.as_str();
        let mut ui = Progress::deleting(Component::Ui);
        let mut relay = Progress::deleting(Component::Relay);

        let mut report = DisableReport::default();
        let mut failures = Vec::new();
        for (progress, resources) in [
            (
                &mut ui,
                vec![
                    ResourceRef::new(ResourceKind::Service, manifests::UI_NAME),
                    ResourceRef::new(ResourceKind::Deployment, manifests::UI_NAME),
                ],
            ),
            (
                &mut relay,
                vec![
                    ResourceRef::new(ResourceKind::Service, manifests::RELAY_NAME),
                    ResourceRef::new(ResourceKind::Deployment, manifests::RELAY_NAME),
                    ResourceRef::new(ResourceKind::ConfigMap, manifests::RELAY_CONFIG_NAME),
                    ResourceRef::new(ResourceKind::Secret, manifests::RELAY_CLIENT_CERTS_NAME),
                ],
            ),
        ] {
            let failed = failures.len();
            for resource in resources {
                match self.gateway.delete(ns, &resource).await {
                    Ok(()) => {
                        tracing::info!(%ns, %resource, "Deleted");
                        report.deleted.push(resource);
                    }
                    Err(error) if error.is_not_found() => {
                        tracing::debug!(%ns, %resource, "Already absent");
                        report.absent.push(resource);
                    }
                    Err(source) => {
                        tracing::warn!(%ns, %resource, error = %source, "Failed to delete");
                        failures.push(DeleteFailure { resource, source });
                    }
                }
            }
            progress.advance(if failures.len() == failed {
                Phase::Absent
            } else {
                Phase::Failed
            });
        }

        if !failures.is_empty() {
            return Err(DisableError::AggregateDeleteFailure { failures, report });
        }
        tracing::info!(%ns, deleted = report.deleted.len(), "Disabled");
        Ok(report)
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

/// Issues a create, treating a conflict as a concurrent success.
async fn create<T>(
    resource: ResourceRef,
    request: impl Future<Output = Result<T, GatewayError>>,
    report: &mut EnableReport,
) -> Result<(), EnableError> {
    match request.await {
        Ok(_) => {
            tracing::info!(%resource, "Created");
            report.created.push(resource);
            Ok(())
        }
        Err(error) if error.is_conflict() => {
            tracing::debug!(%resource, "Already exists");
            Ok(())
        }
        Err(source) => Err(EnableError::Create { resource, source }),
    }
}

// === impl Component ===

impl Component {
    /// The name shared by the component's deployment and service.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Relay => manifests::RELAY_NAME,
            Self::Ui => manifests::UI_NAME,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Ui => f.write_str("ui"),
        }
    }
}

// === impl Phase ===

impl Phase {
    /// Moves to `next` if the lifecycle permits it.
    pub fn transition(self, next: Phase) -> Result<Phase, InvalidTransition> {
        use Phase::*;
        match (self, next) {
            (Absent, Creating)
            | (Creating, WaitingReady)
            | (Creating, Failed)
            | (WaitingReady, Ready)
            | (WaitingReady, TimedOut)
            | (Absent | WaitingReady | Ready, Deleting)
            | (Deleting, Absent)
            | (Deleting, Failed) => Ok(next),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }

    /// Returns true if no further transitions are possible in this
    /// invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::WaitingReady => "waiting-ready",
            Self::Ready => "ready",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Progress ===

impl Progress {
    /// Starts from what was observed: a component is only considered
    /// installed once all of its resources exist.
    fn observed(component: Component, workload: Workload, installed: bool) -> Self {
        let phase = match (installed, workload.ready) {
            (false, _) => Phase::Absent,
            (true, false) => Phase::WaitingReady,
            (true, true) => Phase::Ready,
        };
        Self { component, phase }
    }

    fn deleting(component: Component) -> Self {
        tracing::debug!(%component, "Deleting");
        Self {
            component,
            phase: Phase::Deleting,
        }
    }

    fn advance(&mut self, next: Phase) {
        match self.phase.transition(next) {
            Ok(phase) => {
                tracing::debug!(component = %self.component, from = %self.phase, to = %phase, "Transition");
                self.phase = phase;
            }
            Err(error) => {
                tracing::error!(component = %self.component, %error, "Ignoring phase change");
            }
        }
    }
}

// === impl EnableError ===

impl From<InvalidParams> for EnableError {
    fn from(error: InvalidParams) -> Self {
        match error {
            InvalidParams::UiRequiresRelay => Self::UiRequiresRelay,
            error => Self::InvalidParams(error),
        }
    }
}

struct ComponentList<'a>(&'a [Component]);

impl fmt::Display for ComponentList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

struct FailureList<'a>(&'a [DeleteFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, DeleteFailure { resource, source }) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{resource}: {source}")?;
        }
        Ok(())
    }
}
