//! Alert engine data model: field selectors, threshold rules, alerts,
//! and the transient per-rule threshold state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Closed enumeration of snapshot fields a threshold rule may observe.
/// An ad-hoc string expression like `"cpu.usage > 80"` is only ever a
/// human-readable label attached to the rule; the selector itself is
/// always one of these variants, never parsed from the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSelector {
    CpuUsagePct,
    MemoryUsagePct,
    DiskUsagePct,
    DrawdownCurrentPct,
    PnlDaily,
}

impl FieldSelector {
    /// Resolve this selector against a snapshot. Unknown selectors
    /// cannot occur (the enum is closed); a selector whose underlying
    /// field is absent for this snapshot's shape simply reads as 0.0.
    pub fn resolve(self, snapshot: &crate::model::MetricSnapshot) -> f64 {
        match self {
            FieldSelector::CpuUsagePct => snapshot.host.cpu_usage_pct,
            FieldSelector::MemoryUsagePct => snapshot.host.memory_usage_pct(),
            FieldSelector::DiskUsagePct => snapshot.host.disk_usage_pct(),
            FieldSelector::DrawdownCurrentPct => snapshot.domain.drawdown.current_pct,
            FieldSelector::PnlDaily => snapshot.domain.performance.pnl_daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    GreaterThan,
    LessThan,
    Equals,
    NotEquals,
}

impl Comparator {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > threshold,
            Comparator::LessThan => value < threshold,
            Comparator::Equals => (value - threshold).abs() < f64::EPSILON,
            Comparator::NotEquals => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Console,
    Email,
    Webhook,
    Chat,
}

/// A threshold rule: predicate plus the duration/cooldown/rate-limit
/// gates that decide when the predicate firing becomes an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Unique name; also used as the alert id prefix.
    pub name: String,
    pub category: String,
    pub severity: Severity,
    pub field: FieldSelector,
    /// Human-readable label only, e.g. `"cpu.usage > 80"`. Never parsed.
    pub label: String,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Minimum time the predicate must hold true before an alert fires.
    #[serde(default)]
    pub duration_secs: u64,
    /// Minimum time between two alerts from this rule.
    #[serde(default)]
    pub cooldown_secs: u64,
    pub channels: HashSet<Channel>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ThresholdRule {
    pub fn evaluate_predicate(&self, snapshot: &crate::model::MetricSnapshot) -> bool {
        let value = self.field.resolve(snapshot);
        self.comparator.apply(value, self.threshold)
    }
}

/// Transient per-rule state tracking how long a predicate has held true.
#[derive(Debug, Clone, Default)]
pub struct ThresholdState {
    pub first_triggered_ms: Option<i64>,
    pub consecutive_triggers: u64,
    pub last_alert_ms: Option<i64>,
}

impl ThresholdState {
    /// True once the predicate has been continuously true for at
    /// least `duration_secs` as of `now_ms`.
    pub fn duration_met(&self, duration_secs: u64, now_ms: i64) -> bool {
        match self.first_triggered_ms {
            Some(first) => (now_ms - first) >= (duration_secs as i64) * 1000,
            None => false,
        }
    }

    pub fn cooldown_elapsed(&self, cooldown_secs: u64, now_ms: i64) -> bool {
        match self.last_alert_ms {
            Some(last) => (now_ms - last) >= (cooldown_secs as i64) * 1000,
            None => true,
        }
    }

    pub fn reset(&mut self) {
        self.first_triggered_ms = None;
        self.consecutive_triggers = 0;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub message: String,
    /// Subset of the triggering snapshot's fields relevant to this alert.
    pub payload: Option<serde_json::Value>,
    pub channels: HashSet<Channel>,
    pub created_ms: i64,
    pub acknowledged: bool,
    pub resolved_ms: Option<i64>,
}

impl Alert {
    pub fn new(
        rule: &ThresholdRule,
        title: String,
        message: String,
        payload: Option<serde_json::Value>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: format!("{}-{}", rule.name, now_ms),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            category: rule.category.clone(),
            title,
            message,
            payload,
            channels: rule.channels.clone(),
            created_ms: now_ms,
            acknowledged: false,
            resolved_ms: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> ThresholdRule {
        ThresholdRule {
            name: "cpu-high".into(),
            category: "system".into(),
            severity: Severity::Warning,
            field: FieldSelector::CpuUsagePct,
            label: "cpu.usage > 80".into(),
            comparator: Comparator::GreaterThan,
            threshold: 80.0,
            duration_secs: 60,
            cooldown_secs: 300,
            channels: [Channel::Console].into_iter().collect(),
            enabled: true,
        }
    }

    #[test]
    fn predicate_true_above_threshold() {
        let snap = crate::model::MetricSnapshot::new(
            0,
            crate::model::HostMetrics {
                cpu_usage_pct: 85.0,
                ..Default::default()
            },
            crate::model::DomainMetrics::default(),
        );
        assert!(rule().evaluate_predicate(&snap));
    }

    #[test]
    fn duration_not_met_before_elapsed() {
        let mut state = ThresholdState::default();
        state.first_triggered_ms = Some(0);
        assert!(!state.duration_met(60, 30_000));
        assert!(state.duration_met(60, 60_000));
    }

    #[test]
    fn cooldown_elapsed_with_no_prior_alert() {
        let state = ThresholdState::default();
        assert!(state.cooldown_elapsed(300, 0));
    }
}
