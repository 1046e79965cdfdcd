//! Gateway: HTTP control plane for the orchestrator.
//!
//! Single port. Health check, snapshot, autopilot toggle and retry; everything else goes
//! through the orchestrator handle.

mod server;

pub use server::{router, run_gateway, shutdown_signal};
