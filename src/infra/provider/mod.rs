//! Upstream GPU instance provider contract.
//!
//! Everything the orchestrator needs from the provider's REST API, expressed
//! as one async trait. Calls always go through a
//! [`ResilienceGate`](crate::resilience::ResilienceGate); implementations only
//! classify failures into the error taxonomy.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorResult;

pub use http::HttpProvider;
pub use memory::InMemoryProvider;

/// Instance status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// Being allocated.
    Creating,
    /// Pulling the container image.
    Pulling,
    /// Booting.
    Starting,
    /// Up and serving.
    Running,
    /// Shutting down.
    Stopping,
    /// Not running (stopped by request or reclaimed).
    Exited,
    /// Provider-side failure.
    Failed,
    /// Being deleted.
    Removing,
    /// Deleted.
    Removed,
    /// Being moved to new capacity.
    Migrating,
    /// Anything this client does not recognise.
    #[serde(other)]
    Unknown,
}

impl ProviderStatus {
    /// Still on its way to Running.
    #[must_use]
    pub const fn is_booting(self) -> bool {
        matches!(self, Self::Creating | Self::Pulling | Self::Starting | Self::Migrating)
    }
}

/// One instance as the provider sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    /// Provider-assigned id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Current status.
    pub status: ProviderStatus,
    /// Product (GPU SKU) the instance runs on.
    #[serde(default)]
    pub product_id: Option<String>,
    /// Region or cluster.
    #[serde(default)]
    pub region: Option<String>,
}

/// Body of a create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    /// Display name.
    pub name: String,
    /// Product (GPU SKU).
    pub product_id: String,
    /// Container image.
    pub image_url: String,
    /// Exposed container ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Container environment.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Preferred region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Capability set consumed from the provider.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Create an instance, returning its provider id.
    async fn create_instance(&self, request: &CreateInstanceRequest) -> OrchestratorResult<String>;
    /// Start a stopped instance.
    async fn start_instance(&self, provider_id: &str) -> OrchestratorResult<()>;
    /// Stop a running instance.
    async fn stop_instance(&self, provider_id: &str) -> OrchestratorResult<()>;
    /// Delete an instance.
    async fn delete_instance(&self, provider_id: &str) -> OrchestratorResult<()>;
    /// Move an exited spot instance onto fresh capacity.
    async fn migrate_instance(&self, provider_id: &str) -> OrchestratorResult<()>;
    /// Fetch one instance.
    async fn get_instance(&self, provider_id: &str) -> OrchestratorResult<ProviderInstance>;
    /// Every instance owned by the account.
    async fn list_instances(&self) -> OrchestratorResult<Vec<ProviderInstance>>;
}
