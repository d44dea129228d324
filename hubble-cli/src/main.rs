#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use hubble::{
    config::{self, DisableParams, EnableParams, ForwardParams, ServiceType},
    operation::{Operation, Outcome},
    shutdown::Completion,
    ClientArgs,
};
use std::{sync::Arc, time::Duration};

#[derive(Parser)]
#[clap(name = "hubble", version, about = "Hubble observability")]
struct Args {
    /// The tracing filter used for logs
    #[arg(
        long,
        env = "HUBBLE_LOG",
        default_value = hubble::log::DEFAULT_FILTER,
        global = true
    )]
    log_level: hubble::LogFilter,

    /// The logging format
    #[arg(long, default_value = "plain", global = true)]
    log_format: hubble::LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Enable Hubble observability
    Enable(EnableArgs),

    /// Disable Hubble observability
    Disable(DisableArgs),

    /// Forward the relay port to the local machine
    PortForward(PortForwardArgs),

    /// Open the Hubble UI
    Ui(UiArgs),
}

#[derive(Debug, clap::Args)]
struct EnableArgs {
    /// Namespace Cilium is running in
    #[arg(short, long, default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Deploy Hubble Relay
    #[arg(
        long,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    relay: bool,

    /// Image path to use for Relay
    #[arg(long, default_value = config::DEFAULT_RELAY_IMAGE)]
    relay_image: String,

    /// Version of Relay to deploy
    #[arg(long, default_value = config::DEFAULT_RELAY_VERSION)]
    relay_version: String,

    /// Type of Kubernetes service to expose Hubble Relay
    #[arg(long, default_value = "ClusterIP")]
    relay_service_type: ServiceType,

    /// Enable Hubble UI
    #[arg(long)]
    ui: bool,

    /// Automatically create CA if needed
    #[arg(long)]
    create_ca: bool,

    /// Timeout for Cilium to become ready before deploying Hubble components
    #[arg(long, default_value = "5m")]
    cilium_ready_timeout: Timeout,

    #[clap(flatten)]
    client: ClientArgs,
}

#[derive(Debug, clap::Args)]
struct DisableArgs {
    /// Namespace Cilium is running in
    #[arg(short, long, default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    #[clap(flatten)]
    client: ClientArgs,
}

#[derive(Debug, clap::Args)]
struct PortForwardArgs {
    /// Namespace Cilium is running in
    #[arg(short, long, default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Local port to forward to
    #[arg(long, default_value_t = 4245)]
    port_forward: u16,

    #[clap(flatten)]
    client: ClientArgs,
}

#[derive(Debug, clap::Args)]
struct UiArgs {
    /// Namespace Cilium is running in
    #[arg(short, long, default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Local port to use for the port forward
    #[arg(long, default_value_t = 12000)]
    port_forward: u16,

    #[clap(flatten)]
    client: ClientArgs,
}

/// A Go-style duration, e.g. `5m` or `1m30s`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Timeout(Duration);

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        command,
    } = Args::parse();

    log_format.try_init(log_level)?;

    let operation = command.into_operation();
    let action = operation.action();
    tracing::debug!(?operation, "Running");
    let (shutdown, watch) = hubble::shutdown::channel();

    let res = tokio::select! {
        biased;

        // The operation holds the watch and returns promptly once a signal is
        // received.
        res = run(operation, watch) => res,

        res = shutdown.on_signal() => match res? {
            Completion::Terminated => bail!("terminated"),
            Completion::Aborted => bail!("aborted"),
        },
    };

    match res {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(error) => {
            eprintln!("Unable to {action}: {error}");
            std::process::exit(1);
        }
    }
}

async fn run(operation: Operation, shutdown: hubble::shutdown::Watch) -> Result<Outcome> {
    let client = ClientArgs::with_context(operation.context().map(str::to_string));
    let gateway = client.try_gateway().await?;
    let outcome = operation.run(Arc::new(gateway), shutdown).await?;
    Ok(outcome)
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Enabled(report) => {
            for resource in &report.created {
                println!("Created {resource}");
            }
            println!(
                "Hubble was successfully enabled (relay: {}, ui: {})",
                report.relay, report.ui
            );
        }
        Outcome::Disabled(report) => {
            for resource in &report.deleted {
                println!("Deleted {resource}");
            }
            println!("Hubble was successfully disabled");
        }
        Outcome::Forwarded => {}
    }
}

// === impl Command ===

impl Command {
    fn into_operation(self) -> Operation {
        match self {
            Self::Enable(args) => Operation::Enable(
                EnableParams::default()
                    .with_namespace(args.namespace)
                    .with_relay(args.relay)
                    .with_relay_image(args.relay_image)
                    .with_relay_version(args.relay_version)
                    .with_relay_service_type(args.relay_service_type)
                    .with_ui(args.ui)
                    .with_create_ca(args.create_ca)
                    .with_cilium_ready_timeout(args.cilium_ready_timeout.0)
                    .with_context(args.client.context),
            ),

            Self::Disable(args) => Operation::Disable(
                DisableParams::default()
                    .with_namespace(args.namespace)
                    .with_context(args.client.context),
            ),

            Self::PortForward(args) => Operation::Forward(
                ForwardParams::relay()
                    .with_namespace(args.namespace)
                    .with_local_port(args.port_forward)
                    .with_context(args.client.context),
            ),

            Self::Ui(args) => Operation::Forward(
                ForwardParams::ui()
                    .with_namespace(args.namespace)
                    .with_local_port(args.port_forward)
                    .with_context(args.client.context),
            ),
        }
    }
}

// === impl Timeout ===

impl std::str::FromStr for Timeout {
    type Err = <kube_core::Duration as std::str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<kube_core::Duration>()?.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubble::ForwardTarget;

    fn parse(args: &[&str]) -> Operation {
        Args::try_parse_from(std::iter::once("hubble").chain(args.iter().copied()))
            .expect("arguments must parse")
            .command
            .into_operation()
    }

    #[test]
    fn enable_defaults() {
        let Operation::Enable(params) = parse(&["enable"]) else {
            panic!("expected enable");
        };
        assert_eq!(params, EnableParams::default());
    }

    #[test]
    fn enable_flags() {
        let op = parse(&[
            "enable",
            "-n",
            "cilium",
            "--relay=false",
            "--relay-service-type",
            "LoadBalancer",
            "--create-ca",
            "--cilium-ready-timeout",
            "1m30s",
            "--context",
            "kind-test",
        ]);
        assert_eq!(op.context(), Some("kind-test"));
        let Operation::Enable(params) = op else {
            panic!("expected enable");
        };
        assert_eq!(params.namespace, "cilium");
        assert!(!params.relay);
        assert!(params.create_ca);
        assert_eq!(params.relay_service_type, ServiceType::LoadBalancer);
        assert_eq!(params.cilium_ready_timeout, Duration::from_secs(90));
    }

    #[test]
    fn bare_relay_flag_enables_relay() {
        let Operation::Enable(params) = parse(&["enable", "--relay", "--ui"]) else {
            panic!("expected enable");
        };
        assert!(params.relay);
        assert!(params.ui);
    }

    #[test]
    fn rejects_unknown_service_type() {
        let res = Args::try_parse_from(["hubble", "enable", "--relay-service-type", "External"]);
        assert!(res.is_err());
    }

    #[test]
    fn forward_ports() {
        let Operation::Forward(relay) = parse(&["port-forward"]) else {
            panic!("expected port-forward");
        };
        assert_eq!(relay.target, ForwardTarget::Relay);
        assert_eq!(relay.local_port, 4245);

        let Operation::Forward(ui) = parse(&["ui", "--port-forward", "8080"]) else {
            panic!("expected ui");
        };
        assert_eq!(ui.target, ForwardTarget::Ui);
        assert_eq!(ui.local_port, 8080);
    }

    #[test]
    fn actions() {
        assert_eq!(parse(&["disable"]).action(), "disable Hubble");
        assert_eq!(parse(&["ui"]).action(), "port forward");
    }
}
