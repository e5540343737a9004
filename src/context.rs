//! Application context
//!
//! Owns the store and the sync machinery, and fixes their order:
//! migrate the store file, open it, subscribe to its commits, build the
//! remote and coordinator, and only then start the background worker.

use crate::config::{CoreConfig, RemoteConfig};
use crate::db::{CommitEvent, Database, DbError};
use crate::migration::{self, executor::remove_store_files, MigrationError, MigrationOutcome};
use crate::schema::SchemaError;
use crate::sync::{
    ConsoleRemote, CycleOutcome, HttpRemote, HttpSetupError, LocalChangeTracker, OfflineRemote,
    RemoteAdapter, SyncCoordinator, SyncError, SyncHandle, SyncWorker, WorkerError,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The store matches no known layout. Recoverable only by discarding it.
    #[error("Store {path:?} is not compatible with this version (signature {signature})")]
    IncompatibleStore { path: PathBuf, signature: String },

    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Remote setup failed: {0}")]
    Remote(#[from] HttpSetupError),

    #[error("Sync worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct AppContext {
    config: CoreConfig,
    db: Arc<Database>,
    coordinator: Arc<SyncCoordinator>,
    /// Commit feed taken over by the worker when it starts
    commits: Mutex<Option<mpsc::UnboundedReceiver<CommitEvent>>>,
    worker: Option<SyncWorker>,
}

impl AppContext {
    pub fn open(config: CoreConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let path = config.store_path.clone();

        match migration::migrate(&path) {
            Ok(MigrationOutcome::Migrated { from, to, steps }) => {
                log::info!("Store migrated from version {} to {} ({} steps)", from, to, steps)
            }
            Ok(outcome) => log::debug!("Migration outcome: {:?}", outcome),
            Err(MigrationError::Schema(SchemaError::NoCompatibleVersion { signature })) => {
                log::error!("Store {:?} matches no known schema version", path);
                return Err(StartupError::IncompatibleStore { path, signature });
            }
            Err(e) => return Err(e.into()),
        }

        let db = match Database::open(&path) {
            Ok(db) => Arc::new(db),
            Err(DbError::Schema(SchemaError::NoCompatibleVersion { signature })) => {
                return Err(StartupError::IncompatibleStore { path, signature });
            }
            Err(e) => return Err(e.into()),
        };
        let commits = db.subscribe();

        let remote = build_remote(&config.sync.remote)?;
        log::info!("Store ready at {:?}; sync remote: {}", path, remote.name());
        let coordinator = Arc::new(
            SyncCoordinator::new(db.clone(), remote).with_push_batch_size(config.sync.push_batch_size),
        );

        Ok(Self {
            config,
            db,
            coordinator,
            commits: Mutex::new(Some(commits)),
            worker: None,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Start the background worker. Returns `None` when sync is disabled.
    /// Must be called from within a tokio runtime.
    pub fn start_sync(&mut self) -> Result<Option<SyncHandle>, StartupError> {
        if let Some(worker) = &self.worker {
            return Ok(Some(worker.handle()));
        }
        if !self.config.sync.enabled {
            log::info!("Sync disabled by configuration");
            return Ok(None);
        }

        let commits = self
            .commits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| self.db.subscribe());
        let worker = SyncWorker::spawn(self.coordinator.clone(), commits, self.config.sync.interval_minutes)?;
        let handle = worker.handle();
        self.worker = Some(worker);
        Ok(Some(handle))
    }

    /// Run one cycle in the caller's task, without the background worker
    pub async fn run_single_cycle(&self) -> Result<CycleOutcome, SyncError> {
        let tracker = LocalChangeTracker::new(self.coordinator.queue().clone());
        {
            let mut commits = self.commits.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rx) = commits.as_mut() {
                tracker.drain(rx)?;
            }
        }
        tracker.reconcile()?;
        self.coordinator.run_cycle().await
    }

    /// Stop the worker, if running
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
        log::info!("Context closed");
    }

    /// Delete the store at `path` with its journal files. Destructive: only
    /// for an incompatible store, after the user confirmed.
    pub fn discard_store(path: &Path) -> Result<(), StartupError> {
        log::warn!("Discarding store {:?}", path);
        remove_store_files(path)?;
        Ok(())
    }
}

fn build_remote(config: &RemoteConfig) -> Result<Arc<dyn RemoteAdapter>, StartupError> {
    Ok(match config {
        RemoteConfig::Console => Arc::new(ConsoleRemote::new()),
        RemoteConfig::Offline => Arc::new(OfflineRemote),
        RemoteConfig::Http { base_url, token } => Arc::new(HttpRemote::new(base_url, token.clone())?),
    })
}
