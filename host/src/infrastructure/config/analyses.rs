//! Location of analysis definitions.

use std::path::PathBuf;

use serde::Deserialize;

/// Settings for discovering analyses.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalysesSettings {
    /// Directory holding `index.yaml` and one subdirectory per analysis.
    pub path: PathBuf,
}

impl Default for AnalysesSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("analyses"),
        }
    }
}
