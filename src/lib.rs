//! # Reading List Core
//!
//! Versioned local book store with local-first multi-device sync.
//!
//! Startup order is fixed by [`context::AppContext`]: the migration
//! pipeline brings the store file to the latest schema, the store is
//! opened, and only then is the sync coordinator built and its worker
//! started.

pub mod config;
pub mod context;
pub mod db;
pub mod migration;
pub mod schema;
pub mod sync;

pub use config::{ConfigError, CoreConfig, RemoteConfig, SyncConfig};
pub use context::{AppContext, StartupError};
pub use db::{Database, DbError};
