//! Runtime configuration.
//!
//! Deserialized by the embedding and handed to the manager at
//! construction. Every tuning knob has a default so an empty object is a
//! valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_restart_limit() -> u32 {
    5
}

fn default_restart_window_secs() -> u64 {
    180
}

fn default_initialize_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    2
}

fn default_will_save_timeout_millis() -> u64 {
    2_000
}

fn default_native_file_watching() -> bool {
    true
}

fn default_watch_ignore() -> Vec<String> {
    vec!["**/.git/**".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Configured workspace roots. A document resolves to the longest root
    /// that is a path-prefix of its saved path.
    #[serde(default)]
    pub workspace_roots: Vec<PathBuf>,

    /// Automatic restarts allowed per root inside one rolling window.
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,

    /// Length of the restart window, in seconds, measured from the first
    /// restart of a streak.
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Deadline for the initialize handshake.
    #[serde(default = "default_initialize_timeout_secs")]
    pub initialize_timeout_secs: u64,

    /// Deadline for the shutdown request during graceful stop.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Deadline for the blocking willSaveWaitUntil request.
    #[serde(default = "default_will_save_timeout_millis")]
    pub will_save_timeout_millis: u64,

    /// Whether the embedding detects filesystem changes itself. When
    /// false, the sync adapter synthesizes watched-file events for saves
    /// and renames.
    #[serde(default = "default_native_file_watching")]
    pub native_file_watching: bool,

    /// Glob patterns for changed paths that are never forwarded.
    #[serde(default = "default_watch_ignore")]
    pub watch_ignore: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_roots: Vec::new(),
            restart_limit: default_restart_limit(),
            restart_window_secs: default_restart_window_secs(),
            initialize_timeout_secs: default_initialize_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            will_save_timeout_millis: default_will_save_timeout_millis(),
            native_file_watching: default_native_file_watching(),
            watch_ignore: default_watch_ignore(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    #[must_use]
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub fn will_save_timeout(&self) -> Duration {
        Duration::from_millis(self.will_save_timeout_millis)
    }
}
