//! Local port forwarding to the relay or UI
//!
//! A [`Session`] owns a listener on the loopback interface. Every accepted
//! connection is proxied through its own tunnel to a ready pod backing the
//! target service. The endpoint is re-checked periodically; when it goes away
//! the session re-resolves it with bounded exponential backoff and ends with
//! [`ForwardError::SessionLost`] once the attempts are exhausted.

use crate::{
    config::{ForwardParams, ForwardTarget},
    gateway::{Gateway, GatewayError, ResourceKind, ResourceRef, Tunnel},
    state,
};
use backon::{ExponentialBuilder, Retryable};
use k8s_openapi::{api::core::v1::Pod, apimachinery::pkg::util::intstr::IntOrString};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::{self, Duration},
};


/// Opens forwarding sessions through a [`Gateway`].
#[derive(Clone)]
pub struct SessionManager {
    gateway: Arc<dyn Gateway>,
    policy: ReconnectPolicy,
}

/// Configures how a session detects and recovers from a lost endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// The number of times the endpoint is re-resolved before giving up.
    pub attempts: usize,

    /// The delay before the first retry.
    pub min_delay: Duration,

    /// The longest delay between retries.
    pub max_delay: Duration,

    /// How often the endpoint is checked while the session is idle.
    pub liveness_interval: Duration,
}

/// A bound listener forwarding to an in-cluster endpoint.
///
/// Dropping the session (or returning from [`Session::run`]) closes the
/// listener and aborts every in-flight connection.
pub struct Session {
    gateway: Arc<dyn Gateway>,
    namespace: String,
    target: ForwardTarget,
    listener: TcpListener,
    local_addr: SocketAddr,
    endpoint: Endpoint,
    live: Liveness,
    policy: ReconnectPolicy,
}

/// A handle that reports whether a session's endpoint is reachable.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

/// The pod and port connections are currently tunnelled to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The pod's name.
    pub pod: String,

    /// The pod port.
    pub port: u16,
}

/// Indicates that a session could not be opened or was lost
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The local port could not be bound
    #[error("local port {port} is unavailable: {source}")]
    PortInUse {
        /// The requested port.
        port: u16,

        /// The bind failure.
        #[source]
        source: std::io::Error,
    },

    /// The target service, a ready pod behind it, or its port does not exist
    #[error("{resource} not found in namespace {namespace}")]
    ResourceNotFound {
        /// The namespace that was searched.
        namespace: String,

        /// What was missing.
        resource: String,
    },

    /// The pod rejected a tunnel
    #[error("connection to {pod}:{port} was refused: {source}")]
    ConnectionRefused {
        /// The target pod.
        pod: String,

        /// The target pod port.
        port: u16,

        /// The tunnel failure.
        #[source]
        source: GatewayError,
    },

    /// The endpoint could not be recovered
    #[error("lost connection to {target} after {attempts} attempts: {source}")]
    SessionLost {
        /// The forwarded endpoint.
        target: ForwardTarget,

        /// How many times recovery was attempted.
        attempts: usize,

        /// The last failure.
        #[source]
        source: Box<ForwardError>,
    },

    /// The cluster could not be read
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

// === impl SessionManager ===

impl SessionManager {
    /// Opens sessions through `gateway` using the default reconnect policy.
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Overrides the reconnect policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Binds the local port and verifies that the target is reachable.
    ///
    /// The port is bound before the cluster is contacted, so an unavailable
    /// port fails fast.
    pub async fn open(&self, params: &ForwardParams) -> Result<Session, ForwardError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, params.local_port));
        let port_in_use = |source| ForwardError::PortInUse {
            port: params.local_port,
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(port_in_use)?;
        let local_addr = listener.local_addr().map_err(port_in_use)?;

        let ns = params.namespace.as_str();
        let endpoint = resolve(&*self.gateway, ns, params.target).await?;
        probe(&*self.gateway, ns, &endpoint).await?;

        tracing::info!(
            %local_addr,
            target = %params.target,
            pod = %endpoint.pod,
            port = endpoint.port,
            "Forwarding"
        );
        Ok(Session {
            gateway: self.gateway.clone(),
            namespace: params.namespace.clone(),
            target: params.target,
            listener,
            local_addr,
            endpoint,
            live: Liveness(Arc::new(AtomicBool::new(true))),
            policy: self.policy,
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// === impl ReconnectPolicy ===

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.attempts.saturating_sub(1))
    }
}

// === impl Session ===

impl Session {
    /// The address the session is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The endpoint connections are currently forwarded to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns true if the endpoint was reachable when last checked.
    pub fn is_live(&self) -> bool {
        self.live.is_live()
    }

    /// Returns a handle that observes liveness after the session is moved
    /// into [`Session::run`].
    pub fn liveness(&self) -> Liveness {
        self.live.clone()
    }

    /// Proxies connections until shutdown is signaled or the endpoint is
    /// lost.
    ///
    /// Shutdown also interrupts a tunnel that is still being opened.
    pub async fn run(mut self, shutdown: drain::Watch) -> Result<(), ForwardError> {
        let cancelled = shutdown.signaled();
        tokio::pin!(cancelled);

        let mut tunnels = JoinSet::new();
        let mut liveness = time::interval_at(
            time::Instant::now() + self.policy.liveness_interval,
            self.policy.liveness_interval,
        );
        liveness.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            // A connection that could not be tunnelled waits for recovery.
            let mut pending: Option<(TcpStream, SocketAddr)> = None;

            tokio::select! {
                biased;

                _ = &mut cancelled => {
                    tracing::debug!(local_addr = %self.local_addr, "Shutting down");
                    break;
                }

                accept = self.listener.accept() => {
                    let Some((socket, peer)) = accepted(accept) else {
                        continue;
                    };
                    let opened = tokio::select! {
                        biased;
                        _ = &mut cancelled => break,
                        res = self.tunnel() => res,
                    };
                    match opened {
                        Ok(tunnel) => {
                            tunnels.spawn(proxy(socket, tunnel, peer));
                            continue;
                        }
                        Err(error) => {
                            tracing::warn!(%peer, %error, "Failed to open tunnel");
                            pending = Some((socket, peer));
                        }
                    }
                }

                _ = liveness.tick() => {
                    let resolved = tokio::select! {
                        biased;
                        _ = &mut cancelled => break,
                        res = resolve(&*self.gateway, &self.namespace, self.target) => res,
                    };
                    match resolved {
                        Ok(endpoint) if endpoint == self.endpoint => continue,
                        Ok(endpoint) => {
                            tracing::info!(pod = %endpoint.pod, port = endpoint.port, "Endpoint moved");
                            self.endpoint = endpoint;
                            continue;
                        }
                        Err(error) => tracing::warn!(%error, "Endpoint unavailable"),
                    }
                }

                Some(res) = tunnels.join_next(), if !tunnels.is_empty() => {
                    if let Err(error) = res {
                        tracing::debug!(%error, "Connection task failed");
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;
                _ = &mut cancelled => break,
                res = self.reconnect() => res?,
            }

            if let Some((socket, peer)) = pending {
                let opened = tokio::select! {
                    biased;
                    _ = &mut cancelled => break,
                    res = self.tunnel() => res,
                };
                match opened {
                    Ok(tunnel) => {
                        tunnels.spawn(proxy(socket, tunnel, peer));
                    }
                    Err(error) => tracing::warn!(%peer, %error, "Dropping connection"),
                }
            }
        }

        tunnels.abort_all();
        Ok(())
    }

    async fn tunnel(&self) -> Result<Tunnel, GatewayError> {
        self.gateway
            .tunnel(&self.namespace, &self.endpoint.pod, self.endpoint.port)
            .await
    }

    /// Re-resolves and probes the endpoint until it succeeds or the policy's
    /// attempts are exhausted.
    async fn reconnect(&mut self) -> Result<(), ForwardError> {
        self.live.set(false);

        let gateway = &*self.gateway;
        let ns = self.namespace.as_str();
        let target = self.target;
        let attempts = AtomicUsize::new(0);
        let attempts = &attempts;

        let recovered = (move || async move {
            attempts.fetch_add(1, Ordering::Relaxed);
            let endpoint = resolve(gateway, ns, target).await?;
            probe(gateway, ns, &endpoint).await?;
            Ok::<_, ForwardError>(endpoint)
        })
        .retry(self.policy.backoff())
        .sleep(time::sleep)
        .when(ForwardError::is_recoverable)
        .notify(|error, delay| tracing::debug!(%error, ?delay, "Reconnect failed; retrying"))
        .await;

        match recovered {
            Ok(endpoint) => {
                tracing::info!(pod = %endpoint.pod, port = endpoint.port, "Reconnected");
                self.endpoint = endpoint;
                self.live.set(true);
                Ok(())
            }
            Err(error) => Err(ForwardError::SessionLost {
                target,
                attempts: attempts.load(Ordering::Relaxed),
                source: Box::new(error),
            }),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("namespace", &self.namespace)
            .field("target", &self.target)
            .field("local_addr", &self.local_addr)
            .field("endpoint", &self.endpoint)
            .field("live", &self.live.is_live())
            .finish_non_exhaustive()
    }
}

// === impl Liveness ===

impl Liveness {
    /// Returns true if the endpoint was reachable when last checked.
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, live: bool) {
        self.0.store(live, Ordering::Release);
    }
}

// === impl ForwardError ===

impl ForwardError {
    /// Returns false for failures that retrying cannot fix.
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Gateway(error) | Self::ConnectionRefused { source: error, .. } => {
                !error.is_forbidden()
            }
            Self::ResourceNotFound { .. } => true,
            Self::PortInUse { .. } | Self::SessionLost { .. } => false,
        }
    }
}

/// Logs a failed accept so that one bad connection does not end the session.
fn accepted(res: std::io::Result<(TcpStream, SocketAddr)>) -> Option<(TcpStream, SocketAddr)> {
    match res {
        Ok(conn) => Some(conn),
        Err(error) => {
            tracing::warn!(%error, "Failed to accept connection");
            None
        }
    }
}

async fn proxy(mut socket: TcpStream, mut tunnel: Tunnel, peer: SocketAddr) {
    match tokio::io::copy_bidirectional(&mut socket, &mut tunnel).await {
        Ok((sent, received)) => tracing::debug!(%peer, sent, received, "Connection closed"),
        Err(error) => tracing::debug!(%peer, %error, "Connection failed"),
    }
}

/// Finds a ready pod behind the target's service and the pod port its
/// service port maps to.
async fn resolve(
    gateway: &dyn Gateway,
    ns: &str,
    target: ForwardTarget,
) -> Result<Endpoint, ForwardError> {
    let name = target.service_name();
    let not_found = |resource: String| ForwardError::ResourceNotFound {
        namespace: ns.to_string(),
        resource,
    };
    let service_ref = ResourceRef::new(ResourceKind::Service, name);

    let spec = gateway
        .service(ns, name)
        .await?
        .and_then(|svc| svc.spec)
        .ok_or_else(|| not_found(service_ref.to_string()))?;

    let selector = spec
        .selector
        .filter(|s| !s.is_empty())
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .ok_or_else(|| not_found(format!("selector for {service_ref}")))?;

    let remote_port = i32::from(target.remote_port());
    let service_port = spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .find(|p| p.port == remote_port)
        .ok_or_else(|| not_found(format!("port {remote_port} on {service_ref}")))?;

    let pod = gateway
        .pods(ns, &selector)
        .await?
        .into_iter()
        .find(state::pod_ready)
        .ok_or_else(|| not_found(format!("ready pod for {service_ref}")))?;
    let pod_name = pod.metadata.name.clone().unwrap_or_default();

    let port = match service_port.target_port {
        None => Some(service_port.port),
        Some(IntOrString::Int(port)) => Some(port),
        Some(IntOrString::String(ref port_name)) => container_port(&pod, port_name),
    }
    .and_then(|port| u16::try_from(port).ok())
    .ok_or_else(|| not_found(format!("target port of {service_ref} on pod {pod_name}")))?;

    tracing::trace!(%ns, pod = %pod_name, port, "Resolved endpoint");
    Ok(Endpoint {
        pod: pod_name,
        port,
    })
}

fn container_port(pod: &Pod, name: &str) -> Option<i32> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.container_port)
}

/// Opens and immediately closes a tunnel to verify the pod accepts them.
async fn probe(gateway: &dyn Gateway, ns: &str, endpoint: &Endpoint) -> Result<(), ForwardError> {
    match gateway.tunnel(ns, &endpoint.pod, endpoint.port).await {
        Ok(tunnel) => {
            drop(tunnel);
            Ok(())
        }
        Err(source) => Err(ForwardError::ConnectionRefused {
            pod: endpoint.pod.clone(),
            port: endpoint.port,
            source,
        }),
    }
}
