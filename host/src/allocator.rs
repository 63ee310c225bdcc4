//! Local port allocation for the control bus.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::debug;

/// Default lower bound of the bus port range.
pub const DEFAULT_PORT_MIN: u16 = 3000;
/// Default upper bound of the bus port range.
pub const DEFAULT_PORT_MAX: u16 = 9000;

/// Errors raised while picking a bus port.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Every port in the range is bound or was already handed out.
    #[error("no free port in range {min}..={max}")]
    Exhausted {
        /// Lower bound of the scanned range.
        min: u16,
        /// Upper bound of the scanned range.
        max: u16,
    },
    /// The requested port lies outside the configured range.
    #[error("port {port} is outside range {min}..={max}")]
    OutOfRange {
        /// Requested port.
        port: u16,
        /// Lower bound of the range.
        min: u16,
        /// Upper bound of the range.
        max: u16,
    },
    /// The requested port is already bound by another socket.
    #[error("port {0} is already in use")]
    InUse(u16),
}

/// Picks unused local TCP ports from a fixed range.
///
/// Ports handed out by one allocator are remembered so that repeated calls
/// never return the same port twice, even if the first one was released in
/// the meantime. The allocator is not coordinated across processes.
#[derive(Debug)]
pub struct AddressAllocator {
    host: IpAddr,
    range: RangeInclusive<u16>,
    issued: HashSet<u16>,
}

impl AddressAllocator {
    /// Creates an allocator for `host` scanning `range`.
    #[must_use]
    pub fn new(host: IpAddr, range: RangeInclusive<u16>) -> Self {
        Self {
            host,
            range,
            issued: HashSet::new(),
        }
    }

    /// Creates an allocator on the loopback interface over the default range.
    #[must_use]
    pub fn loopback() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DEFAULT_PORT_MIN..=DEFAULT_PORT_MAX,
        )
    }

    /// Returns the configured range.
    #[must_use]
    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Returns one currently unused port in range.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::Exhausted` if no port in range can be bound.
    pub fn allocate(&mut self) -> Result<u16, AllocationError> {
        let (min, max) = (*self.range.start(), *self.range.end());
        for port in self.range.clone() {
            if self.issued.contains(&port) {
                continue;
            }
            if self.is_free(port) {
                debug!(port, "allocated bus port");
                self.issued.insert(port);
                return Ok(port);
            }
        }
        Err(AllocationError::Exhausted { min, max })
    }

    /// Validates a caller-supplied port and records it as issued.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError::OutOfRange` if `port` is outside the range and
    /// `AllocationError::InUse` if it is already bound or already issued.
    pub fn reserve(&mut self, port: u16) -> Result<u16, AllocationError> {
        let (min, max) = (*self.range.start(), *self.range.end());
        if !self.range.contains(&port) {
            return Err(AllocationError::OutOfRange { port, min, max });
        }
        if self.issued.contains(&port) || !self.is_free(port) {
            return Err(AllocationError::InUse(port));
        }
        self.issued.insert(port);
        Ok(port)
    }

    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(self.host, port)).is_ok()
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::loopback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_in_range_and_free() {
        let mut allocator = AddressAllocator::loopback();
        let port = allocator.allocate().unwrap();
        assert!((DEFAULT_PORT_MIN..=DEFAULT_PORT_MAX).contains(&port));
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn two_allocations_are_distinct() {
        let mut allocator = AddressAllocator::loopback();
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn reserve_rejects_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut allocator = AddressAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port..=port);
        assert_eq!(allocator.reserve(port), Err(AllocationError::InUse(port)));
    }

    #[test]
    fn reserve_rejects_out_of_range() {
        let mut allocator = AddressAllocator::loopback();
        assert!(matches!(
            allocator.reserve(80),
            Err(AllocationError::OutOfRange { port: 80, .. })
        ));
    }

    #[test]
    fn exhausted_range_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut allocator = AddressAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port..=port);
        assert_eq!(
            allocator.allocate(),
            Err(AllocationError::Exhausted {
                min: port,
                max: port
            })
        );
    }
}
