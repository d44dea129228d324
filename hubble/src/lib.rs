//! Lifecycle management for the Hubble observability add-on, built on [`kube`]
//!
//! The crate is organized around two cores:
//!
//! - the [`reconcile`] module, which enables and disables the relay and UI
//!   components by diffing the desired [`EnableParams`] against what currently
//!   exists in the cluster; and
//! - the [`forward`] module, which exposes an in-cluster service on a local
//!   port for the lifetime of an operator session.
//!
//! Both talk to the cluster exclusively through the [`Gateway`] trait, so that
//! the reconciler's state transitions can be exercised without a cluster.
//! [`KubeGateway`] is the production implementation.
//!
//! # Crate Features
//!
//! - **clap**: Enables a [`clap::Parser`] implementation for [`ClientArgs`] so
//!   that it can be flattened into a binary's arguments.
//! - **rustls-tls**: Use [`rustls`] as the Kubernetes client's TLS
//!   implementation.
//! - **openssl-tls**: Use OpenSSL as the Kubernetes client's TLS
//!   implementation.
//!
//! [`kube`]: https://github.com/kube-rs/kube-rs
//! [`clap::Parser`]: https://docs.rs/clap/4/clap/trait.Parser.html
//! [`rustls`]: https://crates.io/crates/rustls

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod config;
pub mod credentials;
pub mod forward;
pub mod gateway;
pub mod log;
pub mod manifests;
pub mod operation;
pub mod reconcile;
pub mod shutdown;
pub mod state;

pub use self::client::{ClientArgs, ConfigError};
pub use self::config::{DisableParams, EnableParams, ForwardParams, ForwardTarget, ServiceType};
pub use self::gateway::{Gateway, KubeGateway};
pub use self::log::{LogFilter, LogFormat, LogInitError};
pub use self::operation::Operation;
