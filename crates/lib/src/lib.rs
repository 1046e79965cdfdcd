//! Autopilot core library: message discovery, the processing orchestrator, the status store
//! contracts and the HTTP control surface used by the CLI.

pub mod config;
pub mod gateway;
pub mod ingest;
pub mod init;
pub mod message;
pub mod orchestrator;
pub mod registry;
pub mod status;
pub mod store;
