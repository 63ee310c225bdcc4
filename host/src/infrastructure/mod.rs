/// Audit logging for lifecycle events.
pub mod audit;
/// Configuration management for the host.
pub mod config;
/// HTTP server: index, health, metrics and browser sockets.
pub mod server;
/// Telemetry setup for logging, tracing, and metrics.
pub mod telemetry;
