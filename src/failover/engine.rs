//! Failover rule engine (spec.md §4.E) — subscribes to `StandbyManager`
//! health events, evaluates rules every tick and on each event, and
//! dispatches rule actions once a rule's decision is `failover`.
//!
//! Cooldown-via-`RwLock<Option<Instant>>` and action dispatch follow
//! the teacher's `MitigationController` (`route_quality::mitigation`):
//! per-target cooldown gates before any state-changing action runs.

use crate::config::FailoverConfig;
use crate::failover::model::{
    Action, ActionKind, Condition, ConditionKind, ConditionValue, Decision, Execution,
    ExecutionStatus, FailoverRule, StepExecution,
};
use crate::notify::SharedNotifier;
use crate::standby::{Health, HealthStatus, SharedStandbyManager, StandbyEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum FailoverEngineError {
    #[error("a recovery/failover action is already running for rule {0}")]
    AlreadyRunning(String),
}

const EVAL_HISTORY_CAP: usize = 100;

/// Per-condition trailing evaluation history for one rule, bounded to
/// the last 100 entries (spec.md §4.E step 2).
#[derive(Default)]
struct ConditionHistory {
    entries: VecDeque<(i64, bool)>,
}

impl ConditionHistory {
    fn push(&mut self, now_ms: i64, result: bool) {
        self.entries.push_back((now_ms, result));
        while self.entries.len() > EVAL_HISTORY_CAP {
            self.entries.pop_front();
        }
    }

    /// True iff every evaluation back to `now - duration_secs` was true
    /// *and* the history actually reaches back that far — a single
    /// recent true entry does not satisfy a sustained window.
    /// `duration_secs == 0` only checks the most recent evaluation.
    fn holds_for(&self, duration_secs: u64, now_ms: i64) -> bool {
        if duration_secs == 0 {
            return self.entries.back().map(|(_, r)| *r).unwrap_or(false);
        }
        let horizon = now_ms - (duration_secs as i64) * 1000;
        for &(ts, result) in self.entries.iter().rev() {
            if !result {
                return false;
            }
            if ts <= horizon {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Suppresses repeated failover attempts for a thrashing rule, in the
/// shape of the teacher's `mitigation::CircuitBreaker`.
struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Default)]
struct RuleRuntime {
    last_executed: Option<Instant>,
    condition_history: Vec<ConditionHistory>,
    circuit: CircuitBreaker,
}

pub struct FailoverEngine {
    config: FailoverConfig,
    standby: SharedStandbyManager,
    notifier: SharedNotifier,
    runtime: Mutex<HashMap<String, RuleRuntime>>,
    config_overrides: RwLock<HashMap<String, String>>,
    executions: Mutex<Vec<Execution>>,
}

impl FailoverEngine {
    pub fn new(config: FailoverConfig, standby: SharedStandbyManager, notifier: SharedNotifier) -> Self {
        Self {
            config,
            standby,
            notifier,
            runtime: Mutex::new(HashMap::new()),
            config_overrides: RwLock::new(HashMap::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Runs the 5s-tick + event-driven evaluation loop until the
    /// returned handle is dropped or the standby manager's event
    /// channel closes.
    pub async fn run(&self) {
        let mut events = self.standby.subscribe();
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.evaluate_interval_ms));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.evaluate_all(chrono::Utc::now().timestamp_millis()).await;
                }
                event = events.recv() => {
                    match event {
                        Ok(StandbyEvent::HealthChecked { .. } | StandbyEvent::SyncChecked { .. }) => {
                            self.evaluate_all(chrono::Utc::now().timestamp_millis()).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    pub async fn evaluate_all(&self, now_ms: i64) {
        for rule in self.config.rules.clone() {
            if !rule.enabled {
                continue;
            }
            self.evaluate_rule(&rule, now_ms).await;
        }
    }

    async fn evaluate_rule(&self, rule: &FailoverRule, now_ms: i64) {
        if !self.cooldown_elapsed(rule, now_ms) {
            return;
        }
        if self.is_circuit_open(&rule.id) {
            return;
        }

        let results: Vec<bool> = rule
            .conditions
            .iter()
            .enumerate()
            .map(|(idx, cond)| self.evaluate_condition(rule, idx, cond, now_ms))
            .collect();

        let true_count = results.iter().filter(|r| **r).count();
        let confidence = if results.is_empty() {
            0.0
        } else {
            true_count as f64 / results.len() as f64
        };
        let all_true = results.iter().all(|r| *r);
        if !all_true {
            return;
        }

        match rule.decide(confidence) {
            Decision::Failover => self.execute_rule(rule, now_ms).await,
            Decision::Alert => {
                let _ = self
                    .notifier
                    .send(
                        "failover",
                        &format!("Failover rule {} at alert confidence", rule.id),
                        &format!("confidence={confidence:.2}"),
                        crate::alerts::model::Severity::Warning,
                    )
                    .await;
            }
            Decision::Wait => {}
        }
    }

    fn cooldown_elapsed(&self, rule: &FailoverRule, _now_ms: i64) -> bool {
        let runtime = self.runtime.lock();
        match runtime.get(&rule.id).and_then(|r| r.last_executed) {
            Some(last) => last.elapsed() >= Duration::from_secs(rule.cooldown_secs),
            None => true,
        }
    }

    fn evaluate_condition(&self, rule: &FailoverRule, idx: usize, cond: &Condition, now_ms: i64) -> bool {
        let health = cond
            .target_component
            .as_deref()
            .and_then(|c| self.standby.get_component_health(c));

        let instant_result = match health {
            Some(h) => {
                let actual = resolve_actual(cond.kind, &h);
                cond.expected.compare(cond.comparator, &actual)
            }
            None => false,
        };

        let mut runtime = self.runtime.lock();
        let rt = runtime.entry(rule.id.clone()).or_default();
        if rt.condition_history.len() <= idx {
            rt.condition_history.resize_with(idx + 1, ConditionHistory::default);
        }
        rt.condition_history[idx].push(now_ms, instant_result);
        rt.condition_history[idx].holds_for(cond.duration_secs, now_ms)
    }

    async fn execute_rule(&self, rule: &FailoverRule, now_ms: i64) {
        {
            let mut runtime = self.runtime.lock();
            runtime.entry(rule.id.clone()).or_default().last_executed = Some(Instant::now());
        }

        let target_component = rule
            .conditions
            .first()
            .and_then(|c| c.target_component.clone())
            .unwrap_or_default();

        let mut execution = Execution {
            id: format!("{}-{now_ms}", rule.id),
            rule_id: rule.id.clone(),
            target_component,
            started_ms: now_ms,
            ended_ms: None,
            status: ExecutionStatus::Executing,
            steps: Vec::new(),
            error: None,
        };

        for action in &rule.actions {
            let outcome = self.dispatch_action(rule, action).await;
            let failed = outcome.is_err();
            execution.steps.push(StepExecution {
                step_id: format!("{:?}", action.kind),
                status: if failed { ExecutionStatus::Failed } else { ExecutionStatus::Completed },
                retry_count: 0,
                output: outcome.as_ref().ok().cloned(),
                error: outcome.err(),
            });
            if failed {
                execution.status = ExecutionStatus::Failed;
                execution.error = execution.steps.last().and_then(|s| s.error.clone());
                break;
            }
        }
        if execution.status == ExecutionStatus::Executing {
            execution.status = ExecutionStatus::Completed;
        }
        execution.ended_ms = Some(chrono::Utc::now().timestamp_millis());

        match execution.status {
            ExecutionStatus::Completed => self.record_success(&rule.id),
            _ => self.record_failure(&rule.id),
        }

        self.executions.lock().push(execution);
    }

    fn is_circuit_open(&self, rule_id: &str) -> bool {
        let mut runtime = self.runtime.lock();
        let rt = runtime.entry(rule_id.to_string()).or_default();
        match rt.circuit.state {
            CircuitState::Open => match rt.circuit.opened_at {
                Some(opened) if opened.elapsed() >= Duration::from_secs(self.config.circuit_breaker_timeout_s) => {
                    rt.circuit.state = CircuitState::HalfOpen;
                    false
                }
                _ => true,
            },
            _ => false,
        }
    }

    fn record_failure(&self, rule_id: &str) {
        let mut runtime = self.runtime.lock();
        let rt = runtime.entry(rule_id.to_string()).or_default();
        rt.circuit.failures += 1;
        if rt.circuit.failures >= self.config.circuit_breaker_threshold {
            rt.circuit.state = CircuitState::Open;
            rt.circuit.opened_at = Some(Instant::now());
        }
    }

    fn record_success(&self, rule_id: &str) {
        let mut runtime = self.runtime.lock();
        let rt = runtime.entry(rule_id.to_string()).or_default();
        rt.circuit.failures = 0;
        rt.circuit.state = CircuitState::Closed;
        rt.circuit.opened_at = None;
    }

    async fn dispatch_action(&self, rule: &FailoverRule, action: &Action) -> Result<String, String> {
        let action_timeout = Duration::from_millis(action.timeout_ms.unwrap_or(30_000));
        match action.kind {
            ActionKind::FailoverComponent => timeout(action_timeout, self.standby.manual_failover(
                &action.target,
                &format!("failover rule {} triggered", rule.id),
            ))
            .await
            .map_err(|_| "timed out".to_string())?
            .map(|_| "failed over".to_string())
            .map_err(|e| e.to_string()),

            ActionKind::Notify => {
                timeout(
                    action_timeout,
                    self.notifier.send(
                        &action.target,
                        &format!("Failover rule {} fired", rule.id),
                        &format!("{:?}", action.parameters),
                        crate::alerts::model::Severity::Critical,
                    ),
                )
                .await
                .map_err(|_| "timed out".to_string())?
                .map(|_| "notified".to_string())
                .map_err(|e| e.to_string())
            }

            ActionKind::ExecuteScript => {
                let result = timeout(action_timeout, Command::new("sh").arg("-c").arg(&action.target).output()).await;
                match result {
                    Ok(Ok(output)) if output.status.success() => {
                        Ok(String::from_utf8_lossy(&output.stdout).to_string())
                    }
                    Ok(Ok(output)) => Err(String::from_utf8_lossy(&output.stderr).to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timed out".to_string()),
                }
            }

            ActionKind::UpdateConfig => {
                let value = action
                    .parameters
                    .get("value")
                    .cloned()
                    .unwrap_or_default();
                self.config_overrides
                    .write()
                    .insert(action.target.clone(), value.clone());
                Ok(format!("{}={value}", action.target))
            }
        }
    }

    pub fn config_override(&self, path: &str) -> Option<String> {
        self.config_overrides.read().get(path).cloned()
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().clone()
    }
}

/// Maps a condition's declared `kind` to the actual value observed in
/// the Standby Manager's health record for the target component.
fn resolve_actual(kind: ConditionKind, health: &Health) -> ConditionValue {
    match kind {
        ConditionKind::HealthCheck => ConditionValue::Text(
            match health.status {
                HealthStatus::Healthy => "healthy",
                HealthStatus::Degraded => "degraded",
                HealthStatus::Unhealthy => "unhealthy",
            }
            .to_string(),
        ),
        ConditionKind::ResponseTime => ConditionValue::Number(health.response_time_ms as f64),
        ConditionKind::ErrorRate => ConditionValue::Number(health.consecutive_failures as f64),
        ConditionKind::SyncLag => ConditionValue::Number(
            health.sync.map(|s| s.lag_seconds as f64).unwrap_or(0.0),
        ),
        ConditionKind::Custom => ConditionValue::Number(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::model::{ActionKind, ConditionComparator};
    use crate::notify::RecordingNotifier;
    use crate::standby::InMemoryStandbyManager;
    use std::sync::Arc;

    fn rule_with(priority: u8, duration_secs: u64) -> FailoverRule {
        FailoverRule {
            id: "r1".into(),
            enabled: true,
            conditions: vec![Condition {
                kind: ConditionKind::HealthCheck,
                target_component: Some("primary".into()),
                comparator: ConditionComparator::Equals,
                expected: ConditionValue::Text("unhealthy".into()),
                duration_secs,
            }],
            actions: vec![Action {
                kind: ActionKind::FailoverComponent,
                target: "standby".into(),
                parameters: Default::default(),
                timeout_ms: Some(1_000),
            }],
            priority,
            cooldown_secs: 60,
        }
    }

    #[tokio::test]
    async fn unhealthy_high_priority_executes_failover() {
        let standby = Arc::new(InMemoryStandbyManager::new());
        standby.set_health(
            "primary",
            Health {
                status: HealthStatus::Unhealthy,
                response_time_ms: 0,
                consecutive_failures: 5,
                sync: None,
            },
        );
        standby.set_health("standby", Health::healthy());

        let engine = FailoverEngine::new(
            FailoverConfig {
                rules: vec![rule_with(9, 0)],
                ..FailoverConfig::default()
            },
            standby,
            Arc::new(RecordingNotifier::default()),
        );

        engine.evaluate_all(1_000).await;
        assert_eq!(engine.executions().len(), 1);
        assert_eq!(engine.executions()[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn healthy_component_never_fires() {
        let standby = Arc::new(InMemoryStandbyManager::new());
        standby.set_health("primary", Health::healthy());
        standby.set_health("standby", Health::healthy());

        let engine = FailoverEngine::new(
            FailoverConfig {
                rules: vec![rule_with(9, 0)],
                ..FailoverConfig::default()
            },
            standby,
            Arc::new(RecordingNotifier::default()),
        );
        engine.evaluate_all(1_000).await;
        assert!(engine.executions().is_empty());
    }

    #[tokio::test]
    async fn duration_window_requires_sustained_condition() {
        let standby = Arc::new(InMemoryStandbyManager::new());
        standby.set_health(
            "primary",
            Health {
                status: HealthStatus::Unhealthy,
                response_time_ms: 0,
                consecutive_failures: 5,
                sync: None,
            },
        );
        standby.set_health("standby", Health::healthy());

        let engine = FailoverEngine::new(
            FailoverConfig {
                rules: vec![rule_with(9, 30)],
                ..FailoverConfig::default()
            },
            standby,
            Arc::new(RecordingNotifier::default()),
        );
        engine.evaluate_all(0).await;
        assert!(engine.executions().is_empty());
        engine.evaluate_all(30_000).await;
        assert_eq!(engine.executions().len(), 1);
    }
}
