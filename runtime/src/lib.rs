//! Lifecycle layer: spawns language servers, multiplexes documents across
//! them, and keeps each server's view of open documents current.

pub mod config;
pub mod document;
pub mod launch;
pub mod manager;
pub mod session;
pub mod sync;
pub mod watch;

pub use config::RuntimeConfig;
pub use document::{BufferId, DocumentHandle, EditBatch, ViewId};
pub use launch::{CommandLauncher, ServerLauncher, ServerProcess, SpawnedServer};
pub use manager::{
    ManagerHooks, ProgressReporter, SessionEvent, SessionManager, StartError, StopReason,
};
pub use session::Session;
pub use sync::{DocumentSync, SaveBehavior, SyncMode, save_behavior, sync_mode};
pub use watch::{FsChange, WatchFilter};
