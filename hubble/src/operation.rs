//! A single command, ready to run against a cluster

use crate::{
    config::{DisableParams, EnableParams, ForwardParams, ForwardTarget},
    forward::{ForwardError, SessionManager},
    gateway::Gateway,
    reconcile::{DisableError, DisableReport, EnableError, EnableReport, Reconciler},
};
use std::sync::Arc;

/// What the operator asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Install the add-on's components.
    Enable(EnableParams),

    /// Remove the add-on's components.
    Disable(DisableParams),

    /// Expose the relay or UI on a local port until interrupted.
    Forward(ForwardParams),
}

/// What a completed operation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The add-on was enabled.
    Enabled(EnableReport),

    /// The add-on was disabled.
    Disabled(DisableReport),

    /// A forwarding session ended gracefully.
    Forwarded,
}

/// Indicates that an operation failed
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Enabling failed
    #[error(transparent)]
    Enable(#[from] EnableError),

    /// Disabling failed
    #[error(transparent)]
    Disable(#[from] DisableError),

    /// Forwarding failed
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl Operation {
    /// The kubeconfig context the operation targets.
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::Enable(p) => p.context.as_deref(),
            Self::Disable(p) => p.context.as_deref(),
            Self::Forward(p) => p.context.as_deref(),
        }
    }

    /// Describes the operation for failure messages, e.g. `Unable to
    /// enable Hubble`.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Enable(_) => "enable Hubble",
            Self::Disable(_) => "disable Hubble",
            Self::Forward(_) => "port forward",
        }
    }

    /// Runs the operation to completion or until `shutdown` is signaled.
    pub async fn run(
        self,
        gateway: Arc<dyn Gateway>,
        shutdown: drain::Watch,
    ) -> Result<Outcome, Error> {
        match self {
            Self::Enable(params) => {
                let report = Reconciler::new(gateway).enable(&params, shutdown).await?;
                Ok(Outcome::Enabled(report))
            }

            Self::Disable(params) => {
                let report = Reconciler::new(gateway).disable(&params).await?;
                Ok(Outcome::Disabled(report))
            }

            Self::Forward(params) => {
                let session = SessionManager::new(gateway).open(&params).await?;
                match params.target {
                    ForwardTarget::Relay => {
                        tracing::info!(addr = %session.local_addr(), "Relay is available");
                    }
                    ForwardTarget::Ui => {
                        tracing::info!(url = %format!("http://{}", session.local_addr()), "UI is available");
                    }
                }
                session.run(shutdown).await?;
                Ok(Outcome::Forwarded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fake::FakeGateway;
    use tokio::time::Duration;

    #[test]
    fn actions_and_contexts() {
        let op = Operation::Enable(EnableParams::default().with_context(Some("prod".into())));
        assert_eq!(op.action(), "enable Hubble");
        assert_eq!(op.context(), Some("prod"));

        let op = Operation::Disable(DisableParams::default());
        assert_eq!(op.action(), "disable Hubble");
        assert_eq!(op.context(), None);

        assert_eq!(Operation::Forward(ForwardParams::ui()).action(), "port forward");
    }

    #[tokio::test]
    async fn enable_then_disable() {
        let gw = Arc::new(
            FakeGateway::new().with_collector(crate::config::DEFAULT_NAMESPACE, Some(Duration::ZERO)),
        );
        let (_signal, watch) = drain::channel();

        let enable = Operation::Enable(EnableParams::default().with_create_ca(true).with_ui(true));
        let outcome = enable
            .run(gw.clone(), watch.clone())
            .await
            .expect("enable must succeed");
        assert!(matches!(outcome, Outcome::Enabled(ref r) if r.created.len() == 7), "{outcome:?}");

        let outcome = Operation::Disable(DisableParams::default())
            .run(gw.clone(), watch)
            .await
            .expect("disable must succeed");
        assert!(matches!(outcome, Outcome::Disabled(ref r) if r.deleted.len() == 6), "{outcome:?}");
    }

    #[tokio::test]
    async fn failures_keep_their_cause() {
        let gw = Arc::new(FakeGateway::new());
        let (_signal, watch) = drain::channel();

        let err = Operation::Forward(ForwardParams::relay().with_local_port(0))
            .run(gw, watch)
            .await
            .expect_err("nothing to forward to");
        assert!(
            matches!(err, Error::Forward(ForwardError::ResourceNotFound { .. })),
            "{err}"
        );
    }
}
