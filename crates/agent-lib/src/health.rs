//! Health tracking for stage processes
//!
//! Components report their status here; `/healthz` and `/readyz` are served
//! from the registry. A stage is ready once its loop is running and neither
//! the bus nor the store is unhealthy.

use crate::store::CoordinationStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational with problems
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components; empty means healthy
    pub fn compute_status<'a>(
        components: impl IntoIterator<Item = &'a ComponentHealth>,
    ) -> ComponentStatus {
        let mut status = ComponentStatus::Healthy;
        for health in components {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const BUS: &str = "bus";
    pub const STORE: &str = "store";
    pub const STAGE: &str = "stage";
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<DashMap<String, ComponentHealth>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy());
    }

    pub fn update(&self, name: &str, health: ComponentHealth) {
        self.components.insert(name.to_string(), health);
    }

    pub fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy());
    }

    pub fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message));
    }

    pub fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message));
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Ping the store and record the result under the store component
    pub async fn probe_store(&self, store: &dyn CoordinationStore) -> bool {
        match store.ping().await {
            Ok(()) => {
                self.set_healthy(components::STORE);
                true
            }
            Err(e) => {
                warn!(error = %e, "Coordination store probe failed");
                self.set_unhealthy(components::STORE, e.to_string());
                false
            }
        }
    }

    pub fn health(&self) -> HealthResponse {
        let components: BTreeMap<String, ComponentHealth> = self
            .components
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let status = HealthResponse::compute_status(components.values());
        HealthResponse { status, components }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("Stage not yet running".to_string()),
            };
        }
        if self.health().status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError, StoredEntry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl CoordinationStore for Unreachable {
        async fn claim(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Transport("connection refused".to_string()))
        }

        async fn get(&self, _: &str) -> Result<Option<StoredEntry>, StoreError> {
            Err(StoreError::Transport("connection refused".to_string()))
        }

        async fn keys(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Transport("connection refused".to_string()))
        }

        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Transport("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Transport("connection refused".to_string()))
        }
    }

    #[test]
    fn test_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health();
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(!registry.readiness().ready);
    }

    #[test]
    fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::BUS);
        registry.register(components::STAGE);

        registry.set_degraded(components::BUS, "slow polls");
        assert_eq!(registry.health().status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::STAGE, "loop exited");
        assert_eq!(registry.health().status, ComponentStatus::Unhealthy);
    }

    #[test]
    fn test_readiness_requires_running_and_healthy() {
        let registry = HealthRegistry::new();
        registry.register(components::STAGE);
        registry.set_ready(true);
        assert!(registry.readiness().ready);

        registry.set_unhealthy(components::STAGE, "loop exited");
        assert!(!registry.readiness().ready);
    }

    #[tokio::test]
    async fn test_probe_store() {
        let registry = HealthRegistry::new();
        assert!(registry.probe_store(&MemoryStore::new()).await);
        assert_eq!(
            registry.health().components[components::STORE].status,
            ComponentStatus::Healthy
        );

        assert!(!registry.probe_store(&Unreachable).await);
        assert_eq!(registry.health().status, ComponentStatus::Unhealthy);
    }
}
