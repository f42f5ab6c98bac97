//! Process-wide IO abort gate (spec §5). Once tripped, every
//! `throw_if_aborted` call site starts failing with `IOABORT` — irrevocable
//! for the lifetime of the `IoShutdown`.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason(pub String);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("IOABORT: {0}")]
pub struct IoAbortError(pub String);

#[derive(Clone)]
pub struct IoShutdown {
    tx: std::sync::Arc<watch::Sender<Option<AbortReason>>>,
    rx: watch::Receiver<Option<AbortReason>>,
}

impl IoShutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        IoShutdown {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Trips the gate. Idempotent: only the first call's reason sticks.
    pub fn abort(&self, reason: impl Into<String>) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(AbortReason(reason.into()));
                true
            }
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Fails with `IOABORT` if the gate has tripped; callers check this at
    /// loop heads and between slice operations (spec §5), not mid-I/O.
    pub fn throw_if_aborted(&self) -> Result<(), IoAbortError> {
        match self.rx.borrow().as_ref() {
            Some(reason) => Err(IoAbortError(reason.0.clone())),
            None => Ok(()),
        }
    }

    /// Resolves once the gate trips; already-tripped gates resolve
    /// immediately.
    pub async fn wait_for_abort(&self) -> AbortReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever aborting; treat as a permanent
                // wait since callers only await this when they expect abort.
                futures_wait_forever().await;
            }
        }
    }
}

async fn futures_wait_forever() {
    std::future::pending::<()>().await
}

impl Default for IoShutdown {
    fn default() -> Self {
        Self::new()
    }
}
