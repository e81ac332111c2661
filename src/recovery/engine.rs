//! Disaster-recovery orchestrator (spec.md §4.E "Recovery engine").
//!
//! Dependency-ordered sequential execution mirrors the teacher's
//! `MitigationController::run` single-consumer dispatch loop, but
//! operates over a computed plan rather than an unbounded queue.

use crate::config::RecoveryConfig;
use crate::model::MetricSnapshot;
use crate::recovery::model::{
    ComponentOutcome, ComponentStatus, RecoveryComponent, RecoveryExecution, RecoveryStatus,
    RecoveryStep, StepOutcome, ValidationCriteria, ValidationKind, ValidationStep,
};
use crate::standby::{HealthStatus, SharedStandbyManager};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

const MAX_HISTORY: usize = 50;

#[derive(Debug, Error)]
pub enum RecoveryEngineError {
    #[error("a recovery is already in progress")]
    AlreadyRunning,
    #[error("unknown component: {0}")]
    UnknownComponent(String),
}

pub struct RecoveryEngine {
    config: RecoveryConfig,
    standby: SharedStandbyManager,
    running: AtomicBool,
    history: parking_lot::Mutex<Vec<RecoveryExecution>>,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig, standby: SharedStandbyManager) -> Self {
        Self {
            config,
            standby,
            running: AtomicBool::new(false),
            history: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Runs a full recovery for `components` (or every configured
    /// component if `None`), bounded by `max_recovery_time_s`. Refuses
    /// to start if another recovery is already running.
    pub async fn recover(
        &self,
        trigger: String,
        components: Option<HashSet<String>>,
        latest_snapshot: Option<&MetricSnapshot>,
        now_ms: i64,
    ) -> Result<RecoveryExecution, RecoveryEngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RecoveryEngineError::AlreadyRunning);
        }
        let result = self.recover_inner(trigger, components, latest_snapshot, now_ms).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn recover_inner(
        &self,
        trigger: String,
        components: Option<HashSet<String>>,
        latest_snapshot: Option<&MetricSnapshot>,
        now_ms: i64,
    ) -> Result<RecoveryExecution, RecoveryEngineError> {
        let plan = self.build_plan(components.as_ref())?;

        let mut execution = RecoveryExecution {
            id: format!("recovery-{now_ms}"),
            trigger,
            started_ms: now_ms,
            ended_ms: None,
            status: None,
            components: Vec::new(),
            error: None,
        };

        let deadline = Duration::from_secs(self.config.max_recovery_time_s);
        let run = self.run_plan(&plan, &mut execution, latest_snapshot);

        match timeout(deadline, run).await {
            Ok(Ok(())) => {
                execution.status = Some(RecoveryStatus::Completed);
            }
            Ok(Err(failure_at)) => {
                self.rollback_completed(&plan, &mut execution, failure_at).await;
                execution.status = Some(RecoveryStatus::RolledBack);
            }
            Err(_) => {
                execution.error = Some(format!("recovery deadline of {deadline:?} exceeded"));
                let completed = execution.components.len();
                self.rollback_completed(&plan, &mut execution, completed).await;
                execution.status = Some(RecoveryStatus::RolledBack);
            }
        }

        execution.ended_ms = Some(chrono::Utc::now().timestamp_millis());
        self.record(execution.clone());
        Ok(execution)
    }

    /// Sorts the selected components by ascending priority, then by
    /// topological order of the dependency DAG (spec.md §4.E step 1).
    fn build_plan(
        &self,
        components: Option<&HashSet<String>>,
    ) -> Result<Vec<RecoveryComponent>, RecoveryEngineError> {
        let selected: Vec<&RecoveryComponent> = self
            .config
            .components
            .iter()
            .filter(|c| components.map(|set| set.contains(&c.name)).unwrap_or(true))
            .collect();

        if let Some(set) = components {
            let known: HashSet<&str> = self.config.components.iter().map(|c| c.name.as_str()).collect();
            for name in set {
                if !known.contains(name.as_str()) {
                    return Err(RecoveryEngineError::UnknownComponent(name.clone()));
                }
            }
        }

        let by_name: HashMap<&str, &RecoveryComponent> =
            self.config.components.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut ordered = Vec::new();
        let mut visited = HashSet::new();

        fn visit<'a>(
            name: &str,
            by_name: &HashMap<&'a str, &'a RecoveryComponent>,
            visited: &mut HashSet<String>,
            ordered: &mut Vec<RecoveryComponent>,
        ) {
            if visited.contains(name) {
                return;
            }
            visited.insert(name.to_string());
            if let Some(component) = by_name.get(name) {
                for dep in &component.dependencies {
                    visit(dep, by_name, visited, ordered);
                }
                ordered.push((*component).clone());
            }
        }

        let mut by_priority = selected;
        by_priority.sort_by_key(|c| c.priority);
        for component in by_priority {
            visit(&component.name, &by_name, &mut visited, &mut ordered);
        }
        Ok(ordered)
    }

    /// Runs each component in order. Returns `Err(index)` of the
    /// component at which the plan aborted, so the caller can roll
    /// back everything before it.
    async fn run_plan(
        &self,
        plan: &[RecoveryComponent],
        execution: &mut RecoveryExecution,
        latest_snapshot: Option<&MetricSnapshot>,
    ) -> Result<(), usize> {
        for (idx, component) in plan.iter().enumerate() {
            let outcome = self.run_component(component).await;
            let failed = outcome.status == ComponentStatus::Failed;
            execution.components.push(outcome);
            if failed {
                return Err(idx);
            }
        }

        if let Err(e) = self.validate_whole_system(latest_snapshot).await {
            execution.error = Some(e);
            return Err(execution.components.len());
        }
        Ok(())
    }

    async fn run_component(&self, component: &RecoveryComponent) -> ComponentOutcome {
        let mut outcome = ComponentOutcome {
            component: component.name.clone(),
            status: ComponentStatus::Recovering,
            steps: Vec::new(),
            rollback_steps: Vec::new(),
            error: None,
        };

        for dep in &component.dependencies {
            let healthy = self
                .standby
                .get_component_health(dep)
                .map(|h| h.status == HealthStatus::Healthy)
                .unwrap_or(false);
            if !healthy {
                outcome.status = ComponentStatus::Failed;
                outcome.error = Some(format!("dependency unhealthy: {dep}"));
                return outcome;
            }
        }

        for step in &component.steps {
            let step_outcome = self.run_step(step).await;
            let critical_failed = !step_outcome.succeeded && step.critical;
            outcome.steps.push(step_outcome);
            if critical_failed {
                outcome.status = ComponentStatus::Failed;
                outcome.error = outcome.steps.last().and_then(|s| s.error.clone());
                return outcome;
            }
        }

        for validation in &component.validation_steps {
            if let Err(e) = self.run_validation(validation).await {
                outcome.status = ComponentStatus::Failed;
                outcome.error = Some(e);
                return outcome;
            }
        }

        outcome.status = ComponentStatus::Completed;
        outcome
    }

    /// Runs a step under its own timeout; if `retryable`, attempts up
    /// to `retry_attempts + 1` times with `retry_delay` in between.
    async fn run_step(&self, step: &RecoveryStep) -> StepOutcome {
        let max_attempts = if step.retryable { self.config.retry_attempts + 1 } else { 1 };
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(self.config.retry_delay_s)).await;
            }
            match self.exec_step(step).await {
                Ok(output) => {
                    return StepOutcome {
                        step_id: step.id.clone(),
                        succeeded: true,
                        retry_count: attempt,
                        output,
                        error: None,
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        StepOutcome {
            step_id: step.id.clone(),
            succeeded: false,
            retry_count: max_attempts.saturating_sub(1),
            output: String::new(),
            error: last_error,
        }
    }

    /// Spawns the step's command in its own process group so a timeout
    /// can kill the whole subtree, not just the immediate `sh` child —
    /// `kill_on_drop` alone only reaches the direct child and would
    /// leave any grandchildren it spawned running.
    async fn exec_step(&self, step: &RecoveryStep) -> Result<String, String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&step.command);
        for (key, value) in &step.env {
            cmd.env(key, value);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| e.to_string())?;
        let pgid = child.id().map(|id| id as i32);

        match timeout(Duration::from_millis(step.timeout_ms), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).to_string())
                } else {
                    Err(String::from_utf8_lossy(&output.stderr).to_string())
                }
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                if let Some(pgid) = pgid {
                    unsafe {
                        libc::kill(-pgid, libc::SIGKILL);
                    }
                }
                Err("timed out".to_string())
            }
        }
    }

    async fn run_validation(&self, step: &ValidationStep) -> Result<(), String> {
        let passed = match step.kind {
            ValidationKind::HealthCheck | ValidationKind::Connectivity => self
                .standby
                .get_component_health(&step.target)
                .map(|h| h.status == HealthStatus::Healthy)
                .unwrap_or(false),
            ValidationKind::DataIntegrity => match &step.criteria {
                ValidationCriteria::ExpectedValue { expected, .. } => {
                    self.standby
                        .get_component_health(&step.target)
                        .map(|h| format!("{:?}", h.status).to_lowercase() == *expected)
                        .unwrap_or(false)
                }
                ValidationCriteria::Threshold { .. } => false,
            },
            ValidationKind::Performance => match &step.criteria {
                ValidationCriteria::Threshold { threshold } => self
                    .standby
                    .get_component_health(&step.target)
                    .map(|h| (h.response_time_ms as f64) <= *threshold)
                    .unwrap_or(false),
                ValidationCriteria::ExpectedValue { .. } => false,
            },
            ValidationKind::Custom => false,
        };

        if passed {
            Ok(())
        } else {
            Err(format!("validation step {} failed for {}", step.id, step.target))
        }
    }

    /// Whole-system integrity validation (spec.md §4.E step 3): every
    /// named component in `trading_checks`/`data_integrity_checks`
    /// must be healthy, and every `perf_thresholds` entry (keyed by a
    /// field-selector name) must be within bound against the latest
    /// snapshot.
    async fn validate_whole_system(&self, latest_snapshot: Option<&MetricSnapshot>) -> Result<(), String> {
        for name in self.config.validation.trading_checks.iter().chain(self.config.validation.data_integrity_checks.iter()) {
            let healthy = self
                .standby
                .get_component_health(name)
                .map(|h| h.status == HealthStatus::Healthy)
                .unwrap_or(false);
            if !healthy {
                return Err(format!("integrity check failed: {name} is not healthy"));
            }
        }

        if !self.config.validation.perf_thresholds.is_empty() {
            let snapshot = latest_snapshot.ok_or_else(|| "no snapshot available for performance checks".to_string())?;
            for (field, max_value) in &self.config.validation.perf_thresholds {
                let selector: crate::alerts::model::FieldSelector = serde_json::from_value(
                    serde_json::Value::String(field.clone()),
                )
                .map_err(|_| format!("unknown perf_thresholds field: {field}"))?;
                let value = selector.resolve(snapshot);
                if value > *max_value {
                    return Err(format!("performance check failed: {field}={value} > {max_value}"));
                }
            }
        }
        Ok(())
    }

    /// Best-effort reverse-order rollback of every component that
    /// completed before the failure at `failed_at_idx`.
    async fn rollback_completed(&self, plan: &[RecoveryComponent], execution: &mut RecoveryExecution, failed_at_idx: usize) {
        let completed_range = &plan[..failed_at_idx.min(plan.len())];
        for component in completed_range.iter().rev() {
            let outcome_idx = execution.components.iter().position(|o| o.component == component.name);
            let mut rollback_steps = Vec::new();
            for step in &component.rollback_steps {
                let result = self.exec_step(step).await;
                rollback_steps.push(StepOutcome {
                    step_id: step.id.clone(),
                    succeeded: result.is_ok(),
                    retry_count: 0,
                    output: result.clone().unwrap_or_default(),
                    error: result.err(),
                });
            }
            if let Some(idx) = outcome_idx {
                execution.components[idx].rollback_steps = rollback_steps;
                execution.components[idx].status = ComponentStatus::RolledBack;
            }
        }
    }

    fn record(&self, execution: RecoveryExecution) {
        let mut history = self.history.lock();
        history.push(execution);
        while history.len() > MAX_HISTORY {
            history.remove(0);
        }
    }

    pub fn history(&self) -> Vec<RecoveryExecution> {
        self.history.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::model::{RecoveryComponent, RecoveryStep};
    use crate::standby::{Health, InMemoryStandbyManager};
    use std::sync::Arc;

    fn healthy_standby() -> Arc<InMemoryStandbyManager> {
        let standby = Arc::new(InMemoryStandbyManager::new());
        standby.set_health("db", Health::healthy());
        standby.set_health("api", Health::healthy());
        standby
    }

    fn component(name: &str, priority: i32, deps: Vec<&str>) -> RecoveryComponent {
        RecoveryComponent {
            name: name.to_string(),
            priority,
            dependencies: deps.into_iter().map(String::from).collect(),
            steps: vec![RecoveryStep {
                id: format!("{name}-step"),
                description: "noop".into(),
                command: "true".into(),
                timeout_ms: 1_000,
                critical: true,
                retryable: false,
                env: Default::default(),
            }],
            validation_steps: vec![],
            rollback_steps: vec![],
        }
    }

    #[tokio::test]
    async fn recovers_in_dependency_order() {
        let standby = healthy_standby();
        let config = RecoveryConfig {
            components: vec![component("api", 2, vec!["db"]), component("db", 1, vec![])],
            max_recovery_time_s: 60,
            ..RecoveryConfig::default()
        };
        let engine = RecoveryEngine::new(config, standby);
        let execution = engine.recover("test".into(), None, None, 0).await.unwrap();
        assert_eq!(execution.status, Some(RecoveryStatus::Completed));
        assert_eq!(execution.components[0].component, "db");
        assert_eq!(execution.components[1].component, "api");
    }

    #[tokio::test]
    async fn refuses_concurrent_recovery() {
        let standby = healthy_standby();
        let config = RecoveryConfig {
            components: vec![component("db", 1, vec![])],
            max_recovery_time_s: 60,
            ..RecoveryConfig::default()
        };
        let engine = Arc::new(RecoveryEngine::new(config, standby));
        engine.running.store(true, Ordering::SeqCst);
        let result = engine.recover("test".into(), None, None, 0).await;
        assert!(matches!(result, Err(RecoveryEngineError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn unhealthy_dependency_fails_component() {
        let standby = Arc::new(InMemoryStandbyManager::new());
        standby.set_health("db", Health {
            status: HealthStatus::Unhealthy,
            response_time_ms: 0,
            consecutive_failures: 3,
            sync: None,
        });
        let config = RecoveryConfig {
            components: vec![component("api", 1, vec!["db"])],
            max_recovery_time_s: 60,
            ..RecoveryConfig::default()
        };
        let engine = RecoveryEngine::new(config, standby);
        let execution = engine.recover("test".into(), None, None, 0).await.unwrap();
        assert_eq!(execution.status, Some(RecoveryStatus::RolledBack));
    }
}
