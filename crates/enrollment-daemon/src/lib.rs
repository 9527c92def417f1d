//! enrollment-daemon library: tokio wiring for the enrollment engine.
//!
//! Exposes the in-memory flow fabric, timers, nodes and configuration so the
//! binary and the integration tests share them.

pub mod config;
pub mod fabric;
pub mod node;
pub mod simulation;
pub mod timers;

// Re-export key types for convenience
pub use config::{AddressRange, DaemonConfig, ProcessConfig};
pub use fabric::{Fabric, FabricEndpoint};
pub use node::{EventStream, NodeEvent, NodeHandle};
pub use simulation::Simulation;
pub use timers::TokioTimers;
