//! Orchestrator (spec.md §2, §6, §7) — wires the engines together and
//! exposes the CLI-facing operations. Owns every engine by explicit
//! reference rather than through module-level singletons, per spec.md
//! §9's redesign flag on the source's singleton-accessor pattern.

use crate::alerts::engine::AlertEngine;
use crate::alerts::model::{Channel, Severity};
use crate::config::Config;
use crate::failover::engine::FailoverEngine;
use crate::model::MetricSnapshot;
use crate::notify::SharedNotifier;
use crate::recovery::engine::RecoveryEngine;
use crate::retention::RetentionStore;
use crate::sampler::{DomainSource, Sampler};
use crate::standby::SharedStandbyManager;
use crate::validator::Validator;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub state: HealthState,
    pub sampler_ticks_ok: bool,
    pub retention_bytes: u64,
    pub open_alert_count: usize,
    pub recovery_in_progress: bool,
    pub details: Vec<String>,
}

/// Aggregates engine error counters into the three-state health model
/// spec.md §7 describes. Each field is incremented by the owning
/// engine on a transient failure and is never re-thrown past this
/// boundary.
#[derive(Default)]
struct ErrorCounters {
    retention_errors: u64,
    sampler_domain_errors: u64,
}

pub struct Orchestrator {
    config: Config,
    sampler: Arc<Sampler>,
    retention: Arc<RetentionStore>,
    alerts: Arc<AlertEngine>,
    validator: Arc<Validator>,
    failover: Arc<FailoverEngine>,
    recovery: Arc<RecoveryEngine>,
    latest_snapshot: RwLock<Option<MetricSnapshot>>,
    errors: RwLock<ErrorCounters>,
    metrics_handle: PrometheusHandle,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        domain_source: Arc<dyn DomainSource>,
        standby: SharedStandbyManager,
        notifier: SharedNotifier,
    ) -> Self {
        let sampler = Arc::new(Sampler::new(config.sampler.clone(), domain_source));
        let retention = Arc::new(RetentionStore::new(config.retention.clone()));
        let alerts = Arc::new(AlertEngine::new(config.alerts.clone(), notifier.clone()));
        let validator = Arc::new(Validator::new(config.validator.clone()));
        let failover = Arc::new(FailoverEngine::new(
            config.failover.clone(),
            standby.clone(),
            notifier,
        ));
        let recovery = Arc::new(RecoveryEngine::new(config.recovery.clone(), standby));

        // Only the first `Orchestrator` in a process can own the global
        // recorder; later instances (e.g. in tests) fall back to a
        // private handle so construction never panics.
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle());

        Self {
            config,
            sampler,
            retention,
            alerts,
            validator,
            failover,
            recovery,
            latest_snapshot: RwLock::new(None),
            errors: RwLock::new(ErrorCounters::default()),
            metrics_handle,
        }
    }

    /// Serves `/metrics` (Prometheus text exposition) and `/health`
    /// (JSON health summary) on `addr`, mirroring the teacher's
    /// `route_quality_monitor` binary. Runs until the returned future
    /// is dropped or the process receives a shutdown signal.
    pub async fn serve_metrics(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let this = Arc::clone(self);
        let health_this = Arc::clone(self);
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let this = Arc::clone(&this);
                    async move { this.metrics_handle.render() }
                }),
            )
            .route(
                "/health",
                get(move || {
                    let this = Arc::clone(&health_this);
                    async move { axum::Json(this.health_summary()) }
                }),
            );

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "metrics endpoint listening");
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Starts the sampler, retention maintenance timers, and failover
    /// engine's evaluation loop, feeding every snapshot to the alert
    /// engine and retention store. Runs until `tokio::signal::ctrl_c`
    /// fires, as the teacher's `route_quality_monitor` binary does.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut snapshots = self.sampler.subscribe();
        self.sampler.start()?;

        let cleanup_interval = self.config.retention.cleanup_interval_ms;
        let compress_interval = self.config.retention.compress_interval_ms;
        let retention = Arc::clone(&self.retention);
        let maintenance_task = {
            let retention = Arc::clone(&retention);
            tokio::spawn(async move {
                let mut cleanup_timer = tokio::time::interval(std::time::Duration::from_millis(cleanup_interval.max(1)));
                let mut compress_timer = tokio::time::interval(std::time::Duration::from_millis(compress_interval.max(1)));
                loop {
                    tokio::select! {
                        _ = cleanup_timer.tick() => {
                            if let Err(e) = retention.evict_aged() {
                                tracing::error!(error = %e, "retention eviction failed");
                            }
                            if let Err(e) = retention.enforce_size_cap() {
                                tracing::error!(error = %e, "retention size cap enforcement failed");
                            }
                        }
                        _ = compress_timer.tick() => {
                            if let Err(e) = retention.compress_aged() {
                                tracing::error!(error = %e, "retention compression failed");
                            }
                        }
                    }
                }
            })
        };

        let failover_task = {
            let failover = Arc::clone(&self.failover);
            tokio::spawn(async move { failover.run().await })
        };

        let this = Arc::clone(self);
        let ingest_task = tokio::spawn(async move {
            while let Ok(snapshot) = snapshots.recv().await {
                *this.latest_snapshot.write() = Some(snapshot.clone());
                if let Err(e) = this.retention.append(&snapshot) {
                    this.errors.write().retention_errors += 1;
                    tracing::error!(error = %e, "retention append failed, sample dropped");
                }
                this.alerts.evaluate(&snapshot).await;
            }
        });

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received, stopping engines");

        maintenance_task.abort();
        failover_task.abort();
        ingest_task.abort();
        let _ = self.sampler.stop();
        Ok(())
    }

    /// Three-state health aggregation (spec.md §7): `critical` if
    /// retention writes are failing or a recovery attempt is in
    /// progress with no healthy path, `warning` on any recorded
    /// transient error or open alerts, else `healthy`.
    pub fn health_summary(&self) -> HealthSummary {
        let errors = self.errors.read();
        let open_alerts = self.alerts.alert_count();
        let recovery_in_progress = self.recovery.is_running();
        let retention_bytes = self.retention.total_bytes().unwrap_or(0);

        let mut details = Vec::new();
        let mut state = HealthState::Healthy;

        if errors.retention_errors > 10 {
            state = HealthState::Critical;
            details.push(format!("{} retention write failures", errors.retention_errors));
        } else if errors.retention_errors > 0 {
            state = HealthState::Warning;
            details.push(format!("{} retention write failures", errors.retention_errors));
        }

        if errors.sampler_domain_errors > 0 && state == HealthState::Healthy {
            state = HealthState::Warning;
            details.push(format!("{} domain sampling failures", errors.sampler_domain_errors));
        }

        if open_alerts > 0 && state == HealthState::Healthy {
            state = HealthState::Warning;
            details.push(format!("{open_alerts} open alerts"));
        }

        metrics::gauge!("sentinel_retention_bytes").set(retention_bytes as f64);
        metrics::gauge!("sentinel_open_alerts").set(open_alerts as f64);
        metrics::gauge!("sentinel_recovery_in_progress").set(recovery_in_progress as u8 as f64);
        metrics::gauge!("sentinel_retention_errors_total").set(errors.retention_errors as f64);

        HealthSummary {
            state,
            sampler_ticks_ok: errors.sampler_domain_errors == 0,
            retention_bytes,
            open_alert_count: open_alerts,
            recovery_in_progress,
            details,
        }
    }

    pub async fn test_alerts(&self, now_ms: i64) -> std::collections::HashMap<Channel, bool> {
        self.alerts.test_channels(now_ms).await
    }

    pub async fn trigger_alert(&self, severity: Severity, now_ms: i64) -> crate::alerts::model::Alert {
        let channels: HashSet<Channel> = [Channel::Console].into_iter().collect();
        self.alerts
            .create_manual(
                "manual".to_string(),
                severity,
                format!("Synthetic {severity:?} alert"),
                "Triggered via CLI".to_string(),
                channels,
                now_ms,
            )
            .await
    }

    /// Forces a compression + eviction pass, returning (compressed,
    /// evicted, total_bytes_after).
    pub fn run_maintenance(&self) -> anyhow::Result<(usize, usize, u64)> {
        let compressed = self.retention.compress_aged()?;
        let evicted = self.retention.evict_aged()?;
        let total = self.retention.total_bytes()?;
        Ok((compressed, evicted, total))
    }

    pub fn export_snapshots(&self, days: u32, path: &std::path::Path) -> anyhow::Result<usize> {
        let to = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let from = (chrono::Utc::now() - chrono::Duration::days(days as i64))
            .format("%Y-%m-%d")
            .to_string();
        let snapshots = self.retention.query(&from, &to)?;
        let json = serde_json::to_string_pretty(&snapshots)?;
        std::fs::write(path, json)?;
        Ok(snapshots.len())
    }

    pub async fn validate_deployment(&self, quick: bool) -> anyhow::Result<crate::validator::ValidationReport> {
        Ok(self.validator.validate(quick).await?)
    }

    pub async fn recover(&self, trigger: String, components: Option<HashSet<String>>) -> anyhow::Result<crate::recovery::model::RecoveryExecution> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let snapshot = self.latest_snapshot.read().clone();
        Ok(self
            .recovery
            .recover(trigger, components, snapshot.as_ref(), now_ms)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::notify::RecordingNotifier;
    use crate::sampler::NullDomainSource;
    use crate::standby::InMemoryStandbyManager;

    fn orchestrator_in(dir: &std::path::Path) -> Orchestrator {
        let mut config = Config::default();
        config.retention = RetentionConfig {
            storage_dir: dir.to_string_lossy().to_string(),
            ..RetentionConfig::default()
        };
        Orchestrator::new(
            config,
            Arc::new(NullDomainSource),
            Arc::new(InMemoryStandbyManager::new()),
            Arc::new(RecordingNotifier::default()),
        )
    }

    #[test]
    fn fresh_orchestrator_reports_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let summary = orchestrator.health_summary();
        assert_eq!(summary.state, HealthState::Healthy);
        assert_eq!(summary.open_alert_count, 0);
        assert!(summary.details.is_empty());
    }

    #[tokio::test]
    async fn trigger_alert_surfaces_in_health_summary() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let now_ms = chrono::Utc::now().timestamp_millis();
        let alert = orchestrator.trigger_alert(Severity::Critical, now_ms).await;
        assert_eq!(alert.severity, Severity::Critical);

        let summary = orchestrator.health_summary();
        assert_eq!(summary.state, HealthState::Warning);
        assert_eq!(summary.open_alert_count, 1);
    }

    #[tokio::test]
    async fn recover_with_no_configured_components_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let execution = orchestrator.recover("manual-test".to_string(), None).await.unwrap();
        assert_eq!(execution.status, Some(crate::recovery::model::RecoveryStatus::Completed));
        assert!(execution.components.is_empty());
    }

    #[tokio::test]
    async fn validate_deployment_passes_with_no_configured_probes() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let report = orchestrator.validate_deployment(false).await.unwrap();
        assert!(report.passed);
    }

    #[test]
    fn run_maintenance_reports_zero_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let (compressed, evicted, total_bytes) = orchestrator.run_maintenance().unwrap();
        assert_eq!(compressed, 0);
        assert_eq!(evicted, 0);
        assert_eq!(total_bytes, 0);
    }
}
