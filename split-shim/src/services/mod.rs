//! Service modules for the shim.
//!
//! - The manager owns the instance and wires everything together
//! - The task service holds the lifecycle engine and its RPC handler
//! - The runtime service drives the OCI runtime on the engine's behalf
//! - The shutdown coordinator drains the instance exactly once

pub mod manager;
pub mod runtime;
pub mod shutdown;
pub mod task;
