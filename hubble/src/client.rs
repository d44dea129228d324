//! Builds a Kubernetes client from the local kubeconfig

pub use kube_client::Client;

use crate::gateway::KubeGateway;

/// Selects the cluster an operation runs against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct ClientArgs {
    /// Kubernetes configuration context.
    #[cfg_attr(feature = "clap", clap(long))]
    pub context: Option<String>,
}

/// Indicates that a client could not be configured
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The kubeconfig could not be loaded
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube_client::config::KubeconfigError),

    /// The client could not be built from the configuration
    #[error("failed to build client: {0}")]
    Client(#[from] kube_client::Error),
}

impl ClientArgs {
    /// Uses the given kubeconfig context, or the current one if `None`.
    pub fn with_context(context: Option<String>) -> Self {
        Self { context }
    }

    /// Loads the kubeconfig and builds a client for the selected context.
    pub async fn try_client(self) -> Result<Client, ConfigError> {
        let options = kube_client::config::KubeConfigOptions {
            context: self.context,
            ..Default::default()
        };
        let config = kube_client::Config::from_kubeconfig(&options).await?;
        tracing::debug!(cluster_url = %config.cluster_url, "Loaded kubeconfig");
        Ok(Client::try_from(config)?)
    }

    /// Builds a [`KubeGateway`] for the selected context.
    pub async fn try_gateway(self) -> Result<KubeGateway, ConfigError> {
        self.try_client().await.map(KubeGateway::new)
    }
}
