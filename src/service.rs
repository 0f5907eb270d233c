use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::sync::{SyncCoordinator, SyncSummary};

/// Shared "is the sync service running" flag.
///
/// Clones observe the same value. The owning [`SyncService`] sets it on
/// [`SyncService::start`] and clears it on [`SyncService::stop`]; nothing else
/// should write it.
#[derive(Debug, Clone)]
pub struct ServiceRunningState {
    running: Arc<watch::Sender<bool>>,
}

impl Default for ServiceRunningState {
    fn default() -> Self {
        Self {
            running: Arc::new(watch::Sender::new(false)),
        }
    }
}

impl ServiceRunningState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    fn set(&self, running: bool) {
        self.running.send_replace(running);
    }
}

#[derive(Debug)]
struct IdleWatcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Hosts a [`SyncCoordinator`] for the lifetime of a background run.
///
/// While running, the service hands over to the passive scan whenever the
/// coordinator has nothing connected or connecting, and takes it back as
/// soon as a device becomes active.
#[derive(Debug)]
pub struct SyncService {
    coordinator: SyncCoordinator,
    running: ServiceRunningState,
    watcher: Mutex<Option<IdleWatcher>>,
}

impl SyncService {
    #[must_use]
    pub fn new(coordinator: SyncCoordinator, running: ServiceRunningState) -> Self {
        Self {
            coordinator,
            running,
            watcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn running_state(&self) -> &ServiceRunningState {
        &self.running
    }

    #[must_use]
    pub fn summary(&self) -> SyncSummary {
        self.coordinator.summary()
    }

    /// Starts background monitoring and the idle watcher. Repeated calls are no-ops.
    #[instrument(skip(self), level = "info")]
    pub fn start(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            debug!("sync service already running");
            return;
        }

        self.running.set(true);
        self.coordinator.start_background_monitoring();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let coordinator = self.coordinator.clone();
        let task = tokio::spawn(async move {
            watch_idle(coordinator, token).await;
        });
        *watcher = Some(IdleWatcher { cancel, task });
        info!("sync service started");
    }

    /// Re-runs reconciliation for every enabled device right away.
    pub fn refresh(&self) -> usize {
        self.coordinator.refresh_connections()
    }

    /// Stops the watcher, the passive scan, and every device, then clears
    /// the running flag.
    #[instrument(skip(self), level = "info")]
    pub async fn stop(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(watcher) = watcher else {
            debug!("sync service not running");
            return;
        };

        watcher.cancel.cancel();
        if let Err(error) = watcher.task.await
            && error.is_panic()
        {
            warn!("idle watcher panicked");
        }
        if let Err(error) = self.coordinator.stop_passive_scan().await {
            warn!(%error, "failed to stop passive scan");
        }
        self.coordinator.shutdown().await;
        self.running.set(false);
        info!("sync service stopped");
    }
}

async fn watch_idle(coordinator: SyncCoordinator, cancel: CancellationToken) {
    let mut states = coordinator.device_states();
    let mut scanning = false;

    loop {
        let idle = coordinator.is_idle();
        if idle != scanning {
            let result = if idle {
                coordinator.start_passive_scan().await
            } else {
                coordinator.stop_passive_scan().await
            };
            match result {
                Ok(()) => {
                    scanning = idle;
                    debug!(passive_scan = scanning, "passive scan handoff");
                }
                Err(error) => warn!(%error, idle, "passive scan handoff failed"),
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                states.mark_unchanged();
            }
        }
    }
}
