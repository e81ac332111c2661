//! Disaster-recovery orchestrator data model (spec.md §3, §4.E).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub id: String,
    pub description: String,
    pub command: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    HealthCheck,
    Connectivity,
    DataIntegrity,
    Performance,
    /// Rejected at configuration load, same rationale as the failover
    /// engine's `Custom` condition kind (spec.md §9).
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationCriteria {
    ExpectedValue {
        expected: String,
        comparator: String,
    },
    Threshold {
        threshold: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStep {
    pub id: String,
    pub kind: ValidationKind,
    pub target: String,
    pub criteria: ValidationCriteria,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryComponent {
    pub name: String,
    /// Lower priority value runs first.
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub steps: Vec<RecoveryStep>,
    pub validation_steps: Vec<ValidationStep>,
    #[serde(default)]
    pub rollback_steps: Vec<RecoveryStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Pending,
    Recovering,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub succeeded: bool,
    pub retry_count: u32,
    pub output: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentOutcome {
    pub component: String,
    pub status: ComponentStatus,
    pub steps: Vec<StepOutcome>,
    pub rollback_steps: Vec<StepOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryExecution {
    pub id: String,
    pub trigger: String,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
    pub status: Option<RecoveryStatus>,
    pub components: Vec<ComponentOutcome>,
    pub error: Option<String>,
}
