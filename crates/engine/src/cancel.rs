use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{BatchEvent, BatchObserver};

/// Run state driven by interrupt signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// No new jobs are submitted; in-flight jobs finish normally
    Stopping,
    /// In-flight jobs are drained and the ledger is final
    Stopped,
}

/// Shared stop flag checked before every job submission
///
/// Cancellation is cooperative: a running encoder is never killed, the
/// dispatcher just stops handing out new work.
#[derive(Debug, Clone)]
pub struct CancellationController {
    state: Arc<watch::Sender<RunState>>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::Running);
        CancellationController { state: Arc::new(tx) }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() != RunState::Running
    }

    /// Move from Running to Stopping. Returns false if a stop was already requested.
    pub fn request_stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Stopping;
                true
            } else {
                false
            }
        })
    }

    /// Record that every in-flight job has been drained
    pub fn mark_stopped(&self) {
        self.state.send_replace(RunState::Stopped);
    }

    /// Resolves once a stop has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on a state change
        let _ = rx.wait_for(|state| *state != RunState::Running).await;
    }

    /// Listen for SIGINT/SIGTERM for the rest of the process lifetime
    ///
    /// The first signal requests a stop. Later signals are reported and
    /// otherwise ignored; the run keeps waiting for in-flight jobs.
    pub fn spawn_signal_listener(&self, observer: Arc<dyn BatchObserver>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                wait_for_signal().await;
                if controller.request_stop() {
                    warn!("⏸️  Interrupt received - finishing running jobs, no new jobs will start");
                    observer.on_event(&BatchEvent::StopRequested { repeated: false });
                } else {
                    info!("Already stopping - still waiting for running jobs to finish");
                    observer.on_event(&BatchEvent::StopRequested { repeated: true });
                }
            }
        })
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
