use super::RegisterError;
use std::fmt;

/// The operator's request to stop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Interrupt {
    /// `SIGINT`, or Ctrl-C on Windows.
    Interrupt,

    /// `SIGTERM`, or Ctrl-Break on Windows.
    Terminate,
}

#[derive(Debug)]
#[must_use = "call `Signals::recv` to await a signal"]
pub(super) struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,

    #[cfg(windows)]
    interrupt: tokio::signal::windows::CtrlC,
    #[cfg(windows)]
    terminate: tokio::signal::windows::CtrlBreak,
}

impl Signals {
    #[cfg(unix)]
    pub(super) fn new() -> Result<Self, RegisterError> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(windows)]
    pub(super) fn new() -> Result<Self, RegisterError> {
        use tokio::signal::windows::{ctrl_break, ctrl_c};
        Ok(Self {
            interrupt: ctrl_c()?,
            terminate: ctrl_break()?,
        })
    }

    /// Waits for the next interrupt or termination request.
    pub(super) async fn recv(&mut self) -> Interrupt {
        tokio::select! {
            _ = self.interrupt.recv() => Interrupt::Interrupt,
            _ = self.terminate.recv() => Interrupt::Terminate,
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, cfg!(windows)) {
            (Self::Interrupt, false) => f.write_str("SIGINT"),
            (Self::Terminate, false) => f.write_str("SIGTERM"),
            (Self::Interrupt, true) => f.write_str("Ctrl-C"),
            (Self::Terminate, true) => f.write_str("Ctrl-Break"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registers_handlers() {
        let signals = Signals::new().expect("handlers must register");
        drop(signals);
        assert_eq!(Interrupt::Interrupt.to_string(), "SIGINT");
        assert_eq!(Interrupt::Terminate.to_string(), "SIGTERM");
    }
}
