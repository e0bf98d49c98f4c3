//! metald daemon: configuration, HTTP surface and component wiring
//!
//! The daemon takes its hypervisor backend from the embedder through
//! [`Daemon::with_backend`]. Without one, as in the `metald` binary, the
//! VM lifecycle service is not built and the collector reports degraded.

pub mod api;
pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::Daemon;
