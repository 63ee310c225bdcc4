//! Message bus settings.

use serde::Deserialize;

/// Where the kernel bus listens.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    /// Fixed port. When unset a free port is allocated from the range.
    pub port: Option<u16>,
    /// Lowest port the allocator may hand out.
    pub port_min: u16,
    /// Highest port the allocator may hand out.
    pub port_max: u16,
}
