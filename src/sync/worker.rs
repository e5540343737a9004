//! Background Sync Worker
//!
//! The sync execution context: one spawned task that owns the tracker and
//! drives the coordinator. It reacts to
//! - commands from the UI-facing side (`SyncHandle`)
//! - local commits from the store's commit feed
//! - the periodic schedule tick
//! - the retry timer after a temporary failure
//! - completion of the cycle in flight
//!
//! At most one cycle is in flight. Requests arriving meanwhile are folded
//! into one follow-up cycle.

use super::coordinator::{SyncCoordinator, SyncError};
use super::models::{CycleOutcome, SyncEvent};
use super::tracker::LocalChangeTracker;
use crate::db::{ChangeOrigin, CommitEvent};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: u64 = 30; // Initial retry delay: 30 seconds
const MAX_DELAY_SECS: u64 = 3600; // Max retry delay: 1 hour
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

type CycleFuture = Pin<Box<dyn Future<Output = Result<CycleOutcome, SyncError>> + Send>>;

/// Delay before the automatic retry after `failures` consecutive
/// temporary failures
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let secs = BASE_DELAY_SECS
        .saturating_mul(2_u64.saturating_pow(exponent))
        .min(MAX_DELAY_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    SyncNow,
    ResyncAll,
    ConnectivityLost,
    ConnectivityRestored,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Sync worker is not running")]
    Stopped,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running worker
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncHandle {
    fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.commands.send(command).map_err(|_| WorkerError::Stopped)
    }

    /// Request a cycle as soon as possible
    pub fn sync_now(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::SyncNow)
    }

    /// Request a cycle that refetches every remote record
    pub fn resync_all(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::ResyncAll)
    }

    pub fn connectivity_lost(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::ConnectivityLost)
    }

    pub fn connectivity_restored(&self) -> Result<(), WorkerError> {
        self.send(WorkerCommand::ConnectivityRestored)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct SyncWorker {
    handle: SyncHandle,
    task: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker. `commits` must be a subscription to the same store
    /// the coordinator syncs.
    pub fn spawn(
        coordinator: Arc<SyncCoordinator>,
        commits: mpsc::UnboundedReceiver<CommitEvent>,
        interval_minutes: u64,
    ) -> Result<Self, WorkerError> {
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
            return Err(WorkerError::InvalidInterval(format!(
                "Interval must be {}-{} minutes, got {}",
                MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let period = Duration::from_secs(60 * interval_minutes);
        let task = tokio::spawn(worker_loop(coordinator.clone(), rx, commits, period));

        log::info!("Sync worker started (interval: {} minutes)", interval_minutes);
        Ok(Self {
            handle: SyncHandle {
                commands: tx,
                coordinator,
            },
            task,
        })
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Stop the worker; a cycle in flight is dropped at its next
    /// suspension point
    pub async fn shutdown(self) {
        let _ = self.handle.send(WorkerCommand::Shutdown);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                log::error!("Sync worker task failed: {}", e);
            }
        }
        log::info!("Sync worker stopped");
    }
}

fn track(tracker: &LocalChangeTracker, coordinator: &SyncCoordinator, event: CommitEvent) {
    if event.origin != ChangeOrigin::Local {
        return;
    }
    if let Err(e) = tracker.handle_commit(&event) {
        // Reconciliation at the next start picks the records up
        log::error!("Failed to track local commit: {}", e);
    }
    coordinator.emit(SyncEvent::StoreChanged(event));
}

fn start_cycle(coordinator: Arc<SyncCoordinator>, full: bool) -> CycleFuture {
    Box::pin(async move {
        if full {
            coordinator.resync_all().await
        } else {
            coordinator.run_cycle().await
        }
    })
}

async fn worker_loop(
    coordinator: Arc<SyncCoordinator>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    mut commits: mpsc::UnboundedReceiver<CommitEvent>,
    period: Duration,
) {
    let tracker = LocalChangeTracker::new(coordinator.queue().clone());
    if let Err(e) = tracker.reconcile() {
        log::error!("Startup reconciliation failed: {}", e);
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut in_flight: Option<CycleFuture> = None;
    // Some(full) when a cycle has been requested
    let mut requested: Option<bool> = None;
    let mut retry_at: Option<Instant> = None;
    let mut failures: u32 = 0;
    let mut commits_open = true;

    loop {
        if in_flight.is_none() {
            if let Some(full) = requested.take() {
                // Everything committed so far goes into this cycle's push
                while let Ok(event) = commits.try_recv() {
                    track(&tracker, &coordinator, event);
                }
                in_flight = Some(start_cycle(coordinator.clone(), full));
            }
        }

        tokio::select! {
            command = commands.recv() => match command {
                None | Some(WorkerCommand::Shutdown) => break,
                Some(WorkerCommand::SyncNow) => {
                    requested.get_or_insert(false);
                }
                Some(WorkerCommand::ResyncAll) => {
                    requested = Some(true);
                }
                Some(WorkerCommand::ConnectivityLost) => {
                    coordinator.connectivity_lost();
                    retry_at = None;
                }
                Some(WorkerCommand::ConnectivityRestored) => {
                    if coordinator.connectivity_restored() {
                        failures = 0;
                        requested.get_or_insert(false);
                    }
                }
            },

            event = commits.recv(), if commits_open => match event {
                Some(event) => track(&tracker, &coordinator, event),
                None => {
                    log::warn!("Commit feed closed");
                    commits_open = false;
                }
            },

            _ = ticker.tick() => {
                log::debug!("Scheduled sync triggered");
                requested.get_or_insert(false);
            }

            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                log::info!("Retrying sync after backoff");
                retry_at = None;
                requested.get_or_insert(false);
            }

            result = async {
                match in_flight.as_mut() {
                    Some(cycle) => cycle.await,
                    None => std::future::pending().await,
                }
            }, if in_flight.is_some() => {
                in_flight = None;
                match result {
                    Ok(CycleOutcome::Completed(_)) => {
                        failures = 0;
                        retry_at = None;
                    }
                    Ok(CycleOutcome::TemporaryFailure { .. }) => {
                        failures = failures.saturating_add(1);
                        let delay = backoff_delay(failures);
                        log::info!("Next sync attempt in {} seconds (failure {})", delay.as_secs(), failures);
                        retry_at = Some(Instant::now() + delay);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Sync cycle failed: {}", e);
                        failures = failures.saturating_add(1);
                        retry_at = Some(Instant::now() + backoff_delay(failures));
                    }
                }
            }
        }
    }

    log::info!("Sync worker loop exited");
}

// ============================================================================
// Tests
// ============================================================================
