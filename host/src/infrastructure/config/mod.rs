//! Configuration management for the dashbench host.
//!
//! Settings are layered: built-in defaults, then an optional
//! `dashbench.toml`, then `DASHBENCH__SECTION__KEY` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use dashbench_host::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! ```

pub mod analyses;
pub mod bus;
pub mod kernels;
pub mod server;
pub mod supervisor;
pub mod telemetry;

pub use analyses::AnalysesSettings;
pub use bus::BusSettings;
pub use kernels::KernelSettings;
pub use server::ServerSettings;
pub use supervisor::SupervisorSettings;
pub use telemetry::TelemetrySettings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::allocator::{DEFAULT_PORT_MAX, DEFAULT_PORT_MIN};

const CONFIG_FILE: &str = "dashbench";

/// Top-level configuration for the host.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Message bus settings.
    pub bus: BusSettings,
    /// Kernel supervision settings.
    pub supervisor: SupervisorSettings,
    /// Interpreter and tool names used to launch kernels.
    #[serde(default)]
    pub kernels: KernelSettings,
    /// Where analyses are found.
    #[serde(default)]
    pub analyses: AnalysesSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Loads settings from defaults, `./dashbench.toml` if present and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(Path::new(CONFIG_FILE))
    }

    /// Like [`Settings::new`] but reads the optional file at `file`
    /// (extension may be omitted).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn load(file: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 5000)?
            .set_default("bus.port_min", i64::from(DEFAULT_PORT_MIN))?
            .set_default("bus.port_max", i64::from(DEFAULT_PORT_MAX))?
            .set_default("supervisor.grace_period_ms", 2000)?
            .set_default("supervisor.startup_timeout_ms", 10_000)?
            .set_default("telemetry.service_name", "dashbench")?
            .set_default("telemetry.sampling_ratio", 1.0)?
            .set_default("telemetry.log_level", "info")?
            .add_source(File::from(file).required(false))
            .add_source(Environment::with_prefix("DASHBENCH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_every_section() {
        let settings = Settings::load(Path::new("/nonexistent/dashbench")).unwrap();
        assert_eq!(settings.bus.port_min, DEFAULT_PORT_MIN);
        assert_eq!(settings.bus.port_max, DEFAULT_PORT_MAX);
        assert_eq!(settings.kernels.python, "python");
        assert_eq!(settings.analyses.path, Path::new("analyses"));
        assert!(settings.supervisor.grace_period() > std::time::Duration::ZERO);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashbench.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[bus]\nport = 4100\n[kernels]\npython = \"python3\"\n[analyses]\npath = \"/srv/analyses\""
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.bus.port, Some(4100));
        assert_eq!(settings.kernels.python, "python3");
        assert_eq!(settings.kernels.go, "go");
        assert_eq!(settings.analyses.path, Path::new("/srv/analyses"));
    }
}
