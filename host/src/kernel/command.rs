//! Builds kernel argument vectors from analysis descriptors.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use crate::analysis::{AnalysisDescriptor, KernelKind};
use crate::infrastructure::config::KernelSettings;

/// Flag every external kernel accepts to learn the bus address.
pub const SUBSCRIBE_FLAG: &str = "--subscribe-address";

const SCRIPT_NAME: &str = "analysis.py";

/// A structured command line. Never interpreted by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments after the program.
    pub args: Vec<String>,
    /// Working directory, if the kernel needs one.
    pub cwd: Option<PathBuf>,
}

impl KernelCommand {
    /// Full argument vector including the program.
    #[must_use]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for KernelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Errors raised while preparing a kernel.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The install step ran but reported failure.
    #[error("install step for '{analysis}' failed: {status}")]
    InstallFailed {
        /// Analysis being installed.
        analysis: String,
        /// Exit status of the install tool.
        status: String,
    },
    /// The install tool could not be run at all.
    #[error("could not run install step for '{analysis}': {source}")]
    Io {
        /// Analysis being installed.
        analysis: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Maps descriptors to kernel commands.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    python: String,
    pyspark: String,
    go: String,
}

impl CommandBuilder {
    /// Creates a builder using the configured tool names.
    #[must_use]
    pub fn new(settings: &KernelSettings) -> Self {
        Self {
            python: settings.python.clone(),
            pyspark: settings.pyspark.clone(),
            go: settings.go.clone(),
        }
    }

    /// Builds the command for `descriptor`, or `None` for in-process analyses.
    ///
    /// Kernels that need an install step are installed synchronously first.
    ///
    /// # Errors
    ///
    /// Returns a `BuildError` if the install step fails.
    pub fn build(
        &self,
        descriptor: &AnalysisDescriptor,
        address: SocketAddr,
    ) -> Result<Option<KernelCommand>, BuildError> {
        let flag = format!("{SUBSCRIBE_FLAG}={address}");
        let command = match descriptor.kernel {
            KernelKind::None => return Ok(None),
            KernelKind::Python => script_command(&self.python, descriptor, flag),
            KernelKind::PySpark => script_command(&self.pyspark, descriptor, flag),
            KernelKind::Go => {
                self.go_install(descriptor)?;
                KernelCommand {
                    program: descriptor.name.clone(),
                    args: vec![flag],
                    cwd: Some(descriptor.path.clone()),
                }
            }
        };
        debug!(analysis = %descriptor.name, %command, "kernel command built");
        Ok(Some(command))
    }

    fn go_install(&self, descriptor: &AnalysisDescriptor) -> Result<(), BuildError> {
        info!(analysis = %descriptor.name, "installing go kernel");
        let status = Command::new(&self.go)
            .arg("install")
            .current_dir(&descriptor.path)
            .status()
            .map_err(|source| BuildError::Io {
                analysis: descriptor.name.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(BuildError::InstallFailed {
                analysis: descriptor.name.clone(),
                status: status.to_string(),
            })
        }
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(&KernelSettings::default())
    }
}

fn script_command(program: &str, descriptor: &AnalysisDescriptor, flag: String) -> KernelCommand {
    KernelCommand {
        program: program.to_string(),
        args: vec![
            descriptor
                .path
                .join(SCRIPT_NAME)
                .to_string_lossy()
                .into_owned(),
            flag,
        ],
        cwd: Some(descriptor.path.clone()),
    }
}
