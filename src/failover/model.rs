//! Failover rule engine data model (spec.md §3, §4.E).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    HealthCheck,
    ResponseTime,
    ErrorRate,
    SyncLag,
    /// Rejected at configuration load (spec.md §9): the source's
    /// custom-condition evaluator was a no-op that returned the
    /// expected value itself, making it trivially true. We do not
    /// reproduce that; `custom` is simply unsupported.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionComparator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
}

impl ConditionValue {
    pub fn compare(&self, comparator: ConditionComparator, actual: &ConditionValue) -> bool {
        match (self, actual) {
            (ConditionValue::Number(expected), ConditionValue::Number(actual)) => {
                match comparator {
                    ConditionComparator::Equals => (expected - actual).abs() < f64::EPSILON,
                    ConditionComparator::NotEquals => (expected - actual).abs() >= f64::EPSILON,
                    ConditionComparator::GreaterThan => actual > expected,
                    ConditionComparator::LessThan => actual < expected,
                    ConditionComparator::Contains => false,
                }
            }
            (ConditionValue::Text(expected), ConditionValue::Text(actual)) => match comparator {
                ConditionComparator::Equals => expected == actual,
                ConditionComparator::NotEquals => expected != actual,
                ConditionComparator::Contains => actual.contains(expected.as_str()),
                ConditionComparator::GreaterThan | ConditionComparator::LessThan => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub target_component: Option<String>,
    pub comparator: ConditionComparator,
    pub expected: ConditionValue,
    /// Seconds the condition must have evaluated true continuously.
    /// Zero means "only the latest evaluation matters".
    #[serde(default)]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FailoverComponent,
    Notify,
    ExecuteScript,
    UpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: String,
    #[serde(default)]
    pub parameters: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRule {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// 1..=10, higher runs with more authority (see Decision below).
    pub priority: u8,
    pub cooldown_secs: u64,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Failover,
    Alert,
    Wait,
}

impl FailoverRule {
    /// `confidence = true_conditions / total_conditions`; `failover`
    /// requires both high confidence and high rule priority, otherwise
    /// we downgrade to `alert`, or `wait` if confidence is low
    /// (spec.md §4.E step 3).
    pub fn decide(&self, confidence: f64) -> Decision {
        if confidence >= 0.8 && self.priority >= 8 {
            Decision::Failover
        } else if confidence >= 0.6 {
            Decision::Alert
        } else {
            Decision::Wait
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: ExecutionStatus,
    pub retry_count: u32,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub rule_id: String,
    pub target_component: String,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
    pub status: ExecutionStatus,
    pub steps: Vec<StepExecution>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(priority: u8) -> FailoverRule {
        FailoverRule {
            id: "r1".into(),
            enabled: true,
            conditions: vec![],
            actions: vec![],
            priority,
            cooldown_secs: 60,
        }
    }

    #[test]
    fn full_confidence_high_priority_triggers_failover() {
        assert_eq!(rule(9).decide(1.0), Decision::Failover);
    }

    #[test]
    fn full_confidence_low_priority_triggers_alert() {
        assert_eq!(rule(7).decide(1.0), Decision::Alert);
    }

    #[test]
    fn low_confidence_triggers_wait() {
        assert_eq!(rule(9).decide(0.3), Decision::Wait);
    }
}
