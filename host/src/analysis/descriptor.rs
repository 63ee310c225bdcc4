//! Analysis descriptors and the `index.yaml` loader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Config, ConfigError, File};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::envelope::is_valid_topic;

/// Name of the descriptor document inside the analyses directory.
pub const INDEX_FILE: &str = "index.yaml";

/// How an analysis is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
    /// No external kernel; the analysis runs in-process from the registry.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Python interpreter running `analysis.py`.
    #[serde(rename = "py")]
    Python,
    /// `pyspark` running `analysis.py`.
    #[serde(rename = "pyspark")]
    PySpark,
    /// Go binary installed with `go install`.
    #[serde(rename = "go")]
    Go,
}

impl KernelKind {
    /// Returns true if the analysis runs in a separate process.
    #[must_use]
    pub fn is_external(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// One analysis as declared by the descriptor source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDescriptor {
    /// Unique analysis name; also its URL prefix and bus topic.
    pub name: String,
    /// Kernel kind. An explicit `null` means no kernel.
    #[serde(default, deserialize_with = "kernel_or_none")]
    pub kernel: KernelKind,
    /// Analysis directory. Filled in relative to the index when omitted.
    #[serde(default)]
    pub path: PathBuf,
    /// Extra route names the analysis declares.
    #[serde(default)]
    pub routes: Vec<String>,
    /// Build command for external tooling.
    #[serde(default)]
    pub build: Option<String>,
    /// File patterns for external auto-reload tooling.
    #[serde(default)]
    pub watch: Vec<String>,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
    /// Display description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the analysis is listed on the index.
    #[serde(default = "default_true")]
    pub show_in_index: bool,
}

fn default_true() -> bool {
    true
}

fn kernel_or_none<'de, D>(deserializer: D) -> Result<KernelKind, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<KernelKind>::deserialize(deserializer)?.unwrap_or_default())
}

impl AnalysisDescriptor {
    /// Creates a descriptor with defaults for everything but name and kernel.
    pub fn new(name: impl Into<String>, kernel: KernelKind) -> Self {
        Self {
            name: name.into(),
            kernel,
            path: PathBuf::new(),
            routes: Vec::new(),
            build: None,
            watch: Vec::new(),
            title: None,
            description: None,
            show_in_index: true,
        }
    }

    /// Sets the analysis directory.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }
}

/// Errors raised while loading descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The index could not be read or parsed.
    #[error("failed to load analysis index: {0}")]
    Config(#[from] ConfigError),
    /// Two analyses share a name.
    #[error("duplicate analysis name '{0}'")]
    DuplicateName(String),
    /// A name cannot be used as URL prefix and bus topic.
    #[error("invalid analysis name '{0}'")]
    InvalidName(String),
}

/// Parsed descriptor document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisIndex {
    /// Dashboard title.
    #[serde(default)]
    pub title: Option<String>,
    /// Dashboard description.
    #[serde(default)]
    pub description: Option<String>,
    /// Top-level build command.
    #[serde(default)]
    pub build: Option<String>,
    /// Top-level watch patterns.
    #[serde(default)]
    pub watch: Vec<String>,
    /// Declared analyses.
    #[serde(default)]
    pub analyses: Vec<AnalysisDescriptor>,
}

impl AnalysisIndex {
    /// Loads `<root>/index.yaml`, resolves analysis paths and validates names.
    ///
    /// External analyses whose directory does not exist are skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or names are invalid.
    pub fn load(root: &Path) -> Result<Self, DescriptorError> {
        let index: Self = Config::builder()
            .add_source(File::from(root.join(INDEX_FILE)).required(true))
            .build()?
            .try_deserialize()?;
        index.resolve(root)
    }

    /// Resolves relative paths against `root` and validates the entries.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate or unusable analysis name.
    pub fn resolve(mut self, root: &Path) -> Result<Self, DescriptorError> {
        let mut seen = HashSet::new();
        let mut analyses = Vec::with_capacity(self.analyses.len());

        for mut descriptor in self.analyses {
            if !is_valid_topic(&descriptor.name) || descriptor.name.contains('/') {
                return Err(DescriptorError::InvalidName(descriptor.name));
            }
            if !seen.insert(descriptor.name.clone()) {
                return Err(DescriptorError::DuplicateName(descriptor.name));
            }

            descriptor.path = if descriptor.path.as_os_str().is_empty() {
                root.join(&descriptor.name)
            } else {
                root.join(&descriptor.path)
            };

            if descriptor.kernel.is_external() && !descriptor.path.is_dir() {
                warn!(
                    analysis = %descriptor.name,
                    path = %descriptor.path.display(),
                    "analysis directory not found, skipping"
                );
                continue;
            }
            debug!(analysis = %descriptor.name, kernel = ?descriptor.kernel, "descriptor loaded");
            analyses.push(descriptor);
        }

        self.analyses = analyses;
        Ok(self)
    }

    /// Build commands in declaration order, analyses first.
    #[must_use]
    pub fn build_commands(&self) -> Vec<&str> {
        self.analyses
            .iter()
            .filter_map(|a| a.build.as_deref())
            .chain(self.build.as_deref())
            .collect()
    }

    /// All watch patterns, analyses first.
    #[must_use]
    pub fn watch_patterns(&self) -> Vec<&str> {
        self.analyses
            .iter()
            .flat_map(|a| a.watch.iter())
            .chain(self.watch.iter())
            .map(String::as_str)
            .collect()
    }
}
