//! Runtime-facing session summary.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Project id used when a working directory has no usable final component.
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Derive a project id from a working directory: its final path component.
pub fn project_id_for(working_dir: &str) -> String {
    Path::new(working_dir)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_PROJECT_ID)
        .to_string()
}

/// Parameters for creating a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub working_dir: String,
    /// Named runtime profile; `None` uses the runtime defaults.
    pub bundle_name: Option<String>,
    pub description: String,
    /// Name of the surface asking for the session (e.g. "slack", "web").
    pub surface: String,
}

impl SessionConfig {
    pub fn new(working_dir: impl Into<String>, surface: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            surface: surface.into(),
            ..Self::default()
        }
    }

    pub fn bundle(mut self, name: impl Into<String>) -> Self {
        self.bundle_name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Summary of a backend session.
///
/// Created by `create_session` and only ever mutated by `end_session`,
/// which flips `is_active`. Ended sessions stay queryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Opaque, backend-assigned identifier.
    pub session_id: String,
    pub project_id: String,
    pub working_dir: String,
    pub is_active: bool,
    /// Surface that created the session.
    pub created_by_app: String,
    pub description: String,
}

impl SessionInfo {
    pub fn new(session_id: impl Into<String>, config: &SessionConfig, project_id: &str) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.to_string(),
            working_dir: config.working_dir.clone(),
            is_active: true,
            created_by_app: config.surface.clone(),
            description: config.description.clone(),
        }
    }
}
