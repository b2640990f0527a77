//! Project configuration and on-disk session layout.
//!
//! `ProjectConfig` is the read-only document consumed by the health probe and
//! the implement procedure. `SessionPaths` fixes where a session's durable
//! records live.

mod project;

pub use project::{ProjectConfig, TimeoutConfig};

use std::path::{Path, PathBuf};

/// Per-session directory layout.
///
/// ```text
/// <root>/.steward/
///   state.json
///   feature-list.json
///   traces.json
///   backlog.json
///   checkpoints/
///     <timestamp>_checkpoint-NNN.json
/// ```
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn steward_dir(&self) -> PathBuf {
        self.root.join(".steward")
    }

    pub fn state_file(&self) -> PathBuf {
        self.steward_dir().join("state.json")
    }

    pub fn feature_list_file(&self) -> PathBuf {
        self.steward_dir().join("feature-list.json")
    }

    pub fn traces_file(&self) -> PathBuf {
        self.steward_dir().join("traces.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.steward_dir().join("checkpoints")
    }

    pub fn backlog_file(&self) -> PathBuf {
        self.steward_dir().join("backlog.json")
    }

    pub fn project_config_file(&self) -> PathBuf {
        self.root.join("steward.json")
    }
}
