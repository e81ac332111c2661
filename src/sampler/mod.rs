//! Sampler (spec.md §4.A) — periodic producer of `MetricSnapshot`s.
//!
//! Host counters are read via `sysinfo`, matching the teacher's use of
//! the crate for host telemetry (`performance::cpu`/`memory`/`network`
//! in the teacher repo). Counters are read twice (current vs. previous
//! tick) and differenced to produce network deltas.

use crate::config::SamplerConfig;
use crate::model::{DomainMetrics, HostMetrics, MetricSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysinfo::{Disks, Networks, System};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampler already started")]
    AlreadyStarted,
    #[error("sampler not started")]
    NotStarted,
}

/// Synchronous source of the current domain metric block. May return
/// stale/zero data alongside `Err` rather than block the sampler tick.
#[async_trait]
pub trait DomainSource: Send + Sync {
    async fn sample(&self) -> Result<DomainMetrics, String>;
}

/// `DomainSource` that always returns the zero value, used when domain
/// metrics are disabled or no real source has been wired up.
pub struct NullDomainSource;

#[async_trait]
impl DomainSource for NullDomainSource {
    async fn sample(&self) -> Result<DomainMetrics, String> {
        Ok(DomainMetrics::default())
    }
}

struct PrevNetworkCounters {
    rx_bytes: u64,
    tx_bytes: u64,
}

pub struct Sampler {
    config: SamplerConfig,
    domain_source: Arc<dyn DomainSource>,
    snapshot_tx: broadcast::Sender<MetricSnapshot>,
    system: Mutex<System>,
    prev_network: Mutex<Option<PrevNetworkCounters>>,
    started: AtomicBool,
    stop_tx: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl Sampler {
    pub fn new(config: SamplerConfig, domain_source: Arc<dyn DomainSource>) -> Self {
        let (snapshot_tx, _) = broadcast::channel(256);
        Self {
            config,
            domain_source,
            snapshot_tx,
            system: Mutex::new(System::new_all()),
            prev_network: Mutex::new(None),
            started: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Begins ticking on a background task. Fails if already started.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, SamplerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SamplerError::AlreadyStarted);
        }
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot = this.sample_once().await;
                        let _ = this.snapshot_tx.send(snapshot);
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(handle)
    }

    /// Halts ticking within one tick period. The in-flight sample, if
    /// any, is allowed to complete.
    pub fn stop(&self) -> Result<(), SamplerError> {
        let guard = self.stop_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(true);
                self.started.store(false, Ordering::SeqCst);
                Ok(())
            }
            None => Err(SamplerError::NotStarted),
        }
    }

    /// Assembles one `MetricSnapshot`. Never fails: a failing
    /// sub-source produces a zero-valued block plus a structured log,
    /// never a skipped tick (spec.md §4.A failure semantics).
    pub async fn sample_once(&self) -> MetricSnapshot {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();

        let host = if self.config.enable_host_metrics {
            self.sample_host()
        } else {
            HostMetrics::default()
        };

        let domain = if self.config.enable_domain_metrics {
            match self.domain_source.sample().await {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = %e, "domain source failed, using zero-valued block");
                    DomainMetrics::default()
                }
            }
        } else {
            DomainMetrics::default()
        };

        MetricSnapshot::new(timestamp_ms, host, domain)
    }

    fn sample_host(&self) -> HostMetrics {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cores = system.cpus();
        let core_count = cores.len() as u32;
        let cpu_usage_pct = if core_count == 0 {
            0.0
        } else {
            cores.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / core_count as f64
        };
        let load = System::load_average();

        let memory_total_bytes = system.total_memory();
        let memory_used_bytes = system.used_memory();
        let memory_free_bytes = memory_total_bytes.saturating_sub(memory_used_bytes);

        let disks = Disks::new_with_refreshed_list();
        let (disk_total_bytes, disk_used_bytes) =
            disks.iter().fold((0u64, 0u64), |(t, u), disk| {
                let total = disk.total_space();
                let avail = disk.available_space();
                (t + total, u + total.saturating_sub(avail))
            });
        let disk_free_bytes = disk_total_bytes.saturating_sub(disk_used_bytes);

        let networks = Networks::new_with_refreshed_list();
        let (rx_bytes, tx_bytes) = networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });

        let mut prev = self.prev_network.lock();
        let (rx_delta, tx_delta) = match prev.as_ref() {
            Some(p) => (
                rx_bytes.saturating_sub(p.rx_bytes),
                tx_bytes.saturating_sub(p.tx_bytes),
            ),
            None => (0, 0),
        };
        *prev = Some(PrevNetworkCounters { rx_bytes, tx_bytes });

        HostMetrics {
            cpu_usage_pct,
            load_avg_1: load.one,
            load_avg_5: load.five,
            load_avg_15: load.fifteen,
            core_count,
            memory_total_bytes,
            memory_used_bytes,
            memory_free_bytes,
            heap_used_bytes: 0,
            disk_total_bytes,
            disk_used_bytes,
            disk_free_bytes,
            network_rx_delta_bytes: rx_delta,
            network_tx_delta_bytes: tx_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_tick_has_zero_network_deltas() {
        let sampler = Sampler::new(SamplerConfig::default(), Arc::new(NullDomainSource));
        let snap = sampler.sample_once().await;
        assert_eq!(snap.host.network_rx_delta_bytes, 0);
        assert_eq!(snap.host.network_tx_delta_bytes, 0);
    }

    #[tokio::test]
    async fn failing_domain_source_yields_zero_block_not_skip() {
        struct Failing;
        #[async_trait]
        impl DomainSource for Failing {
            async fn sample(&self) -> Result<DomainMetrics, String> {
                Err("boom".into())
            }
        }
        let sampler = Sampler::new(SamplerConfig::default(), Arc::new(Failing));
        let snap = sampler.sample_once().await;
        assert_eq!(snap.domain, DomainMetrics::default());
    }

    #[tokio::test]
    async fn double_start_fails() {
        let sampler = Arc::new(Sampler::new(
            SamplerConfig {
                interval_ms: 60_000,
                ..SamplerConfig::default()
            },
            Arc::new(NullDomainSource),
        ));
        let _handle = sampler.start().unwrap();
        assert!(matches!(sampler.start(), Err(SamplerError::AlreadyStarted)));
        sampler.stop().unwrap();
    }
}
