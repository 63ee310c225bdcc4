//! Dashbench host - routes browser sessions to analysis kernels.
//!
//! Analyses run either inside the host or as external kernel processes that
//! talk to the host over a local topic-filtered message bus. The host
//! allocates the bus address, launches and supervises kernels, and keeps the
//! traffic of concurrent browser sessions apart.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Address allocation for the kernel bus.
pub mod allocator;
/// Analysis adapters: in-process and bus-backed.
pub mod adapter;
/// Analysis descriptors, the `Analysis` trait and the registry.
pub mod analysis;
/// Message bus between the host and kernels.
pub mod bus;
/// The single task owning routing state.
pub mod hub;
/// Infrastructure components (config, server, telemetry).
pub mod infrastructure;
/// Kernel command building and supervision.
pub mod kernel;
/// Session routing.
pub mod router;
/// Browser WebSocket connections.
pub mod ws;
