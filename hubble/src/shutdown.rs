//! Drives graceful shutdown when the process is interrupted
//!
//! Long-running operations (readiness waits and forwarding sessions) hold a
//! [`Watch`] and stop as soon as it is signaled. Cluster objects that were
//! already created are left in place.

pub use drain::Watch;
use tracing::{debug, info};

mod signals;

use self::signals::Signals;

/// Drives shutdown by watching signals.
#[derive(Debug)]
#[must_use = "call `Shutdown::on_signal` to await a signal"]
pub struct Shutdown(drain::Signal);

/// Indicates whether shutdown completed gracefully or was forced by a second signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Indicates that shutdown completed gracefully.
    Terminated,

    /// Indicates that shutdown did not complete gracefully.
    Aborted,
}

/// Indicates that signal handlers could not be registered
#[derive(Debug, thiserror::Error)]
#[error("failed to register signal handler: {0}")]
pub struct RegisterError(#[from] std::io::Error);

/// Creates a shutdown channel.
///
/// [`Shutdown`] watches for `SIGINT` and `SIGTERM` signals. When a signal is received, [`Watch`]
/// instances are notified and, when all watches are dropped, the shutdown is completed. If a
/// second signal is received while waiting for watches to be dropped, the shutdown is aborted.
pub fn channel() -> (Shutdown, Watch) {
    let (drain_tx, drain_rx) = drain::channel();
    (Shutdown(drain_tx), drain_rx)
}

impl Shutdown {
    /// Watches for signals and drives shutdown.
    ///
    /// If a second signal is received while waiting for watches to be released, this future
    /// completes immediately and [`Completion::Aborted`] is returned.
    ///
    /// An error is returned when signal registration fails.
    pub async fn on_signal(self) -> Result<Completion, RegisterError> {
        let mut signals = Signals::new()?;
        let signal = signals.recv().await;
        info!(%signal, "Shutting down");

        tokio::select! {
            _ = self.0.drain() => {
                debug!("Drained");
                Ok(Completion::Terminated)
            },

            signal = signals.recv() => {
                debug!(%signal, "Aborting");
                Ok(Completion::Aborted)
            },
        }
    }

    /// Notifies all watches and waits for them to be released.
    pub async fn drain(self) {
        self.0.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn drain_releases_watches() {
        let (shutdown, watch) = channel();
        let task = tokio::spawn(async move {
            let release = watch.signaled().await;
            time::sleep(time::Duration::from_secs(1)).await;
            drop(release);
        });

        shutdown.drain().await;
        task.await.expect("task must not panic");
    }
}
