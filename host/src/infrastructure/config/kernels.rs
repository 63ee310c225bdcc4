//! Programs used to launch external kernels.

use serde::Deserialize;

/// Interpreter and tool names, resolved through `PATH` unless absolute.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct KernelSettings {
    /// Python interpreter.
    pub python: String,
    /// PySpark launcher.
    pub pyspark: String,
    /// Go toolchain, used for `go install`.
    pub go: String,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            pyspark: "pyspark".to_string(),
            go: "go".to_string(),
        }
    }
}
