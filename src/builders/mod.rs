//! Builders that assemble a running orchestrator from configuration.

pub mod orchestrator;

pub use orchestrator::{Orchestrator, OrchestratorBuilder, PROVIDER_DEPENDENCY};
