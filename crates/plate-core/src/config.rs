use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::comments::CommentConfig;
use crate::core::EditorConfig;
use crate::slash::SlashConfig;
use crate::sync::SyncConfig;
use crate::toolbar::ToolbarConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid session config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for a [`crate::NoteSession`]. Every field is optional in JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub editor: EditorConfig,
    pub slash: SlashConfig,
    pub toolbar: ToolbarConfig,
    pub sync: SyncConfig,
    pub comments: CommentConfig,
}

impl SessionConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&source)
    }
}
