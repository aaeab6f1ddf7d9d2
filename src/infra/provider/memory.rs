//! In-process provider simulation for development and testing.
//!
//! Instances boot after a configurable number of status polls, and failures
//! can be injected by HTTP status code to exercise retry and breaker paths.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;

use super::http::classify_status;
use super::{CreateInstanceRequest, ProviderApi, ProviderInstance, ProviderStatus};
use crate::core::{OrchestratorError, OrchestratorResult};

#[derive(Debug)]
struct Simulated {
    instance: ProviderInstance,
    polls_until_running: u32,
}

#[derive(Debug)]
struct State {
    instances: BTreeMap<String, Simulated>,
    next_id: u64,
    boot_polls: u32,
    injected: VecDeque<u16>,
    calls: u64,
}

/// Simulated provider.
#[derive(Debug)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    /// Empty provider; ids start at `prov-1`, instances boot after one poll.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                instances: BTreeMap::new(),
                next_id: 1,
                boot_polls: 1,
                injected: VecDeque::new(),
                calls: 0,
            }),
        }
    }

    /// Number the next created instance `prov-{n}`.
    #[must_use]
    pub fn with_next_id(self, n: u64) -> Self {
        self.state.lock().next_id = n;
        self
    }

    /// Status polls an instance spends booting before it reports Running.
    #[must_use]
    pub fn with_boot_polls(self, polls: u32) -> Self {
        self.state.lock().boot_polls = polls;
        self
    }

    /// Fail the next `count` calls with HTTP `status`.
    pub fn fail_next(&self, status: u16, count: usize) {
        let mut state = self.state.lock();
        state.injected.extend(std::iter::repeat_n(status, count));
    }

    /// Add or replace an instance.
    pub fn insert(&self, instance: ProviderInstance) {
        self.state.lock().instances.insert(
            instance.id.clone(),
            Simulated {
                instance,
                polls_until_running: 0,
            },
        );
    }

    /// Force the status of an existing instance.
    pub fn set_status(&self, provider_id: &str, status: ProviderStatus) {
        if let Some(sim) = self.state.lock().instances.get_mut(provider_id) {
            sim.instance.status = status;
            sim.polls_until_running = 0;
        }
    }

    /// Drop an instance as if the provider reclaimed it.
    pub fn remove(&self, provider_id: &str) {
        self.state.lock().instances.remove(provider_id);
    }

    /// Current view of one instance.
    pub fn instance(&self, provider_id: &str) -> Option<ProviderInstance> {
        self.state
            .lock()
            .instances
            .get(provider_id)
            .map(|s| s.instance.clone())
    }

    /// Calls received so far, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    fn enter(&self, op: &str) -> OrchestratorResult<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        state.calls += 1;
        if let Some(code) = state.injected.pop_front() {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(classify_status(status, None, format!("{op}: injected failure")));
        }
        Ok(state)
    }

    fn boot(sim: &mut Simulated, boot_polls: u32) {
        sim.polls_until_running = boot_polls;
        sim.instance.status = if boot_polls == 0 {
            ProviderStatus::Running
        } else {
            ProviderStatus::Starting
        };
    }
}

fn not_found(provider_id: &str) -> OrchestratorError {
    OrchestratorError::PermanentUpstream {
        status: Some(404),
        message: format!("instance {provider_id} not found"),
    }
}

#[async_trait]
impl ProviderApi for InMemoryProvider {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> OrchestratorResult<String> {
        let mut state = self.enter("create_instance")?;
        let id = format!("prov-{}", state.next_id);
        state.next_id += 1;
        let mut sim = Simulated {
            instance: ProviderInstance {
                id: id.clone(),
                name: request.name.clone(),
                status: ProviderStatus::Creating,
                product_id: Some(request.product_id.clone()),
                region: request.region.clone(),
            },
            polls_until_running: 0,
        };
        let boot_polls = state.boot_polls;
        Self::boot(&mut sim, boot_polls);
        state.instances.insert(id.clone(), sim);
        Ok(id)
    }

    async fn start_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        let mut state = self.enter("start_instance")?;
        let boot_polls = state.boot_polls;
        let sim = state
            .instances
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        Self::boot(sim, boot_polls);
        Ok(())
    }

    async fn stop_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        let mut state = self.enter("stop_instance")?;
        let sim = state
            .instances
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        sim.instance.status = ProviderStatus::Exited;
        Ok(())
    }

    async fn delete_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        let mut state = self.enter("delete_instance")?;
        state.instances.remove(provider_id);
        Ok(())
    }

    async fn migrate_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        let mut state = self.enter("migrate_instance")?;
        let boot_polls = state.boot_polls;
        let sim = state
            .instances
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        Self::boot(sim, boot_polls);
        Ok(())
    }

    async fn get_instance(&self, provider_id: &str) -> OrchestratorResult<ProviderInstance> {
        let mut state = self.enter("get_instance")?;
        let sim = state
            .instances
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        if sim.instance.status.is_booting() && sim.polls_until_running > 0 {
            sim.polls_until_running -= 1;
            if sim.polls_until_running == 0 {
                sim.instance.status = ProviderStatus::Running;
            }
        }
        Ok(sim.instance.clone())
    }

    async fn list_instances(&self) -> OrchestratorResult<Vec<ProviderInstance>> {
        let state = self.enter("list_instances")?;
        Ok(state.instances.values().map(|s| s.instance.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: "gpu-1".into(),
            product_id: "p1".into(),
            image_url: "img".into(),
            ports: vec![],
            envs: BTreeMap::new(),
            region: None,
        }
    }

    #[tokio::test]
    async fn boots_after_configured_polls() {
        let p = InMemoryProvider::new().with_next_id(123).with_boot_polls(2);
        let id = p.create_instance(&request()).await.unwrap();
        assert_eq!(id, "prov-123");
        assert_eq!(p.get_instance(&id).await.unwrap().status, ProviderStatus::Starting);
        assert_eq!(p.get_instance(&id).await.unwrap().status, ProviderStatus::Running);
    }

    #[tokio::test]
    async fn injected_failures_are_classified() {
        let p = InMemoryProvider::new();
        p.fail_next(503, 1);
        p.fail_next(400, 1);
        assert!(p.list_instances().await.unwrap_err().is_retryable());
        assert!(!p.list_instances().await.unwrap_err().is_retryable());
        assert!(p.list_instances().await.unwrap().is_empty());
        assert_eq!(p.call_count(), 3);
    }
}
