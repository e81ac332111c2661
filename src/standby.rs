//! `StandbyManager` — the external collaborator contract (spec.md §6)
//! that the failover rule engine subscribes to for health/sync events
//! and that the recovery engine queries for dependency health checks.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncStatus {
    pub lag_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Health {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub consecutive_failures: u32,
    pub sync: Option<SyncStatus>,
}

impl Health {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: 0,
            consecutive_failures: 0,
            sync: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StandbyEvent {
    HealthChecked { component: String, health: Health },
    SyncChecked { component: String, sync: SyncStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum StandbyError {
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("manual failover rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait StandbyManager: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<StandbyEvent>;
    fn get_component_health(&self, name: &str) -> Option<Health>;
    async fn manual_failover(&self, target: &str, reason: &str) -> Result<(), StandbyError>;
}

pub type SharedStandbyManager = Arc<dyn StandbyManager>;

/// In-memory `StandbyManager` used by crate tests and the bundled demo.
/// Real deployments supply their own implementation backed by the
/// actual trading fleet's health-check infrastructure.
pub struct InMemoryStandbyManager {
    health: parking_lot::RwLock<std::collections::HashMap<String, Health>>,
    events_tx: broadcast::Sender<StandbyEvent>,
}

impl InMemoryStandbyManager {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            health: parking_lot::RwLock::new(std::collections::HashMap::new()),
            events_tx,
        }
    }

    pub fn set_health(&self, component: &str, health: Health) {
        self.health
            .write()
            .insert(component.to_string(), health.clone());
        let _ = self.events_tx.send(StandbyEvent::HealthChecked {
            component: component.to_string(),
            health,
        });
    }
}

impl Default for InMemoryStandbyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StandbyManager for InMemoryStandbyManager {
    fn subscribe(&self) -> broadcast::Receiver<StandbyEvent> {
        self.events_tx.subscribe()
    }

    fn get_component_health(&self, name: &str) -> Option<Health> {
        self.health.read().get(name).cloned()
    }

    async fn manual_failover(&self, target: &str, _reason: &str) -> Result<(), StandbyError> {
        if self.health.read().contains_key(target) {
            Ok(())
        } else {
            Err(StandbyError::UnknownComponent(target.to_string()))
        }
    }
}
