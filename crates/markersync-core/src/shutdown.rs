//! Cooperative shutdown signal.
//!
//! A [`Shutdown`] is a cloneable handle over a `tokio::sync::watch` channel.
//! Loops check [`Shutdown::is_shutdown`] at the top of every iteration and
//! race their suspension points (timers, store calls) against
//! [`Shutdown::wait`] with `tokio::select!`. Nothing is interrupted
//! forcibly: an operation that already started runs to completion.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Why shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
    /// Requested through `Shutdown::trigger`
    Manual,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<Option<ShutdownSignal>>,
    receiver: watch::Receiver<Option<ShutdownSignal>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self { sender, receiver }
    }

    pub fn trigger(&self) {
        self.trigger_with(ShutdownSignal::Manual);
    }

    /// Request shutdown. The first signal wins; later ones are ignored.
    pub fn trigger_with(&self, signal: ShutdownSignal) {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(signal);
                true
            } else {
                false
            }
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) -> ShutdownSignal {
        let mut receiver = self.receiver.clone();
        loop {
            if let Some(signal) = *receiver.borrow_and_update() {
                return signal;
            }
            if receiver.changed().await.is_err() {
                return ShutdownSignal::Manual;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` when the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }

    /// Run `future` unless shutdown is requested first, in which case the
    /// future is dropped and `None` is returned.
    ///
    /// Only for suspension points where abandoning the call is harmless
    /// (reads, waits). Writes must be allowed to finish.
    pub async fn guard<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            out = future => Some(out),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("signal", &*self.receiver.borrow())
            .finish()
    }
}

/// Complete when the process receives SIGINT or SIGTERM.
pub async fn os_signal() -> ShutdownSignal {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::SigInt,
            Err(e) => {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<ShutdownSignal>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                ShutdownSignal::SigTerm
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<ShutdownSignal>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
