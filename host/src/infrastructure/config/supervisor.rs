//! Kernel supervision timing.

use std::time::Duration;

use serde::Deserialize;

/// Timeouts applied to kernel processes.
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// How long a kernel may take to exit after shutdown before it is killed.
    pub grace_period_ms: u64,
    /// How long a kernel may take to complete its bus handshake.
    pub startup_timeout_ms: u64,
}

impl SupervisorSettings {
    /// Grace period as a `Duration`.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Startup timeout as a `Duration`.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}
