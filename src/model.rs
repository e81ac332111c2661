//! Core data model shared by every engine: `MetricSnapshot` and its
//! host/domain sub-blocks.
//!
//! Grounded in the teacher's `performance::ComponentMetrics`/
//! `PipelineSnapshot` pattern: plain serde-derived structs, cheap to
//! clone, with `f64`/`u64` fields rather than newtypes, because these
//! values flow straight to JSON lines and threshold comparisons.

use serde::{Deserialize, Serialize};

/// Epsilon used when checking `used + free == total` invariants on
/// resource blocks. Snapshots are sampled from live counters that can
/// shift by a few bytes between reads of used/free/total, so this is
/// deliberately loose.
pub const RESOURCE_EPSILON: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSnapshot {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub host: HostMetrics,
    pub domain: DomainMetrics,
}

impl MetricSnapshot {
    pub fn new(timestamp_ms: i64, host: HostMetrics, domain: DomainMetrics) -> Self {
        Self {
            timestamp_ms,
            host,
            domain,
        }
    }

    /// UTC calendar date (`YYYY-MM-DD`) of this snapshot's timestamp,
    /// used as the retention store's segment key.
    pub fn utc_date(&self) -> String {
        let secs = self.timestamp_ms.div_euclid(1000);
        let nanos = (self.timestamp_ms.rem_euclid(1000)) as u32 * 1_000_000;
        chrono::DateTime::from_timestamp(secs, nanos)
            .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap())
            .format("%Y-%m-%d")
            .to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostMetrics {
    pub cpu_usage_pct: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub core_count: u32,

    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_free_bytes: u64,
    pub heap_used_bytes: u64,

    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_free_bytes: u64,

    /// Bytes received since the previous sample. Zero on the first tick.
    pub network_rx_delta_bytes: u64,
    /// Bytes sent since the previous sample. Zero on the first tick.
    pub network_tx_delta_bytes: u64,
}

impl HostMetrics {
    /// `used + free == total` within `RESOURCE_EPSILON`, for both
    /// memory and disk. Returns the first violation found, if any.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mem_sum = self.memory_used_bytes as f64 + self.memory_free_bytes as f64;
        if (mem_sum - self.memory_total_bytes as f64).abs() > RESOURCE_EPSILON {
            return Err(format!(
                "memory used+free ({mem_sum}) != total ({})",
                self.memory_total_bytes
            ));
        }
        let disk_sum = self.disk_used_bytes as f64 + self.disk_free_bytes as f64;
        if (disk_sum - self.disk_total_bytes as f64).abs() > RESOURCE_EPSILON {
            return Err(format!(
                "disk used+free ({disk_sum}) != total ({})",
                self.disk_total_bytes
            ));
        }
        Ok(())
    }

    pub fn memory_usage_pct(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            0.0
        } else {
            self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0
        }
    }

    pub fn disk_usage_pct(&self) -> f64 {
        if self.disk_total_bytes == 0 {
            0.0
        } else {
            self.disk_used_bytes as f64 / self.disk_total_bytes as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainMetrics {
    pub equity: EquityMetrics,
    pub drawdown: DrawdownMetrics,
    pub positions: PositionMetrics,
    pub performance: PerformanceMetrics,
    /// Reduced-cardinality sub-blocks, keyed by phase name (e.g.
    /// "pre-market", "regular", "after-hours").
    pub phases: Vec<PhaseMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EquityMetrics {
    pub total: f64,
    pub available: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DrawdownMetrics {
    pub current_pct: f64,
    pub maximum_pct: f64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PositionMetrics {
    pub long_count: u32,
    pub short_count: u32,
    pub notional: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub pnl_daily: f64,
    pub pnl_weekly: f64,
    pub pnl_monthly: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
}

/// A reduced-cardinality snapshot of the same shape as the top-level
/// domain block, scoped to one trading phase/session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseMetrics {
    pub phase: String,
    pub equity_total: f64,
    pub pnl: f64,
    pub position_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_at(ts: i64) -> MetricSnapshot {
        MetricSnapshot::new(ts, HostMetrics::default(), DomainMetrics::default())
    }

    #[test]
    fn utc_date_formats_correctly() {
        // 2024-01-02T00:00:00Z
        let snap = snapshot_at(1704153600_000);
        assert_eq!(snap.utc_date(), "2024-01-02");
    }

    #[test]
    fn invariant_passes_for_balanced_resources() {
        let host = HostMetrics {
            memory_total_bytes: 1000,
            memory_used_bytes: 600,
            memory_free_bytes: 400,
            disk_total_bytes: 500,
            disk_used_bytes: 100,
            disk_free_bytes: 400,
            ..Default::default()
        };
        assert!(host.check_invariants().is_ok());
    }

    #[test]
    fn invariant_fails_when_unbalanced() {
        let host = HostMetrics {
            memory_total_bytes: 1000,
            memory_used_bytes: 600,
            memory_free_bytes: 300,
            ..Default::default()
        };
        assert!(host.check_invariants().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let snap = MetricSnapshot::new(
            123_456,
            HostMetrics {
                cpu_usage_pct: 42.5,
                memory_total_bytes: 100,
                memory_used_bytes: 40,
                memory_free_bytes: 60,
                disk_total_bytes: 200,
                disk_used_bytes: 50,
                disk_free_bytes: 150,
                ..Default::default()
            },
            DomainMetrics::default(),
        );
        let json = serde_json::to_string(&snap).unwrap();
        let back: MetricSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
