//! Metrics Collector (component F): pulls performance/reliability/usage
//! numbers from optional collaborators and system/skills numbers from
//! always-available in-process sources, into one snapshot tree.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::warn;

use crate::error::Result;
use crate::skills::SkillRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub avg_latency_ms: HashMap<String, f64>,
    pub p95_latency_ms: HashMap<String, f64>,
    pub total_requests: u64,
    pub requests_by_provider: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReliabilityMetrics {
    pub error_rate_by_provider: HashMap<String, f64>,
    pub rate_limit_count: u64,
    pub rate_limit_by_provider: HashMap<String, u64>,
    pub skill_failure_count: u64,
    pub skill_error_names: Vec<String>,
    pub heartbeat_success_rate: f64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageMetrics {
    pub total_cost_usd_today: f64,
    pub cost_by_provider: HashMap<String, f64>,
    pub total_tokens_input: u64,
    pub total_tokens_output: u64,
    pub heartbeat_total_beats: u64,
    pub heartbeat_total_actions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub memory_rss_mb: f64,
    pub memory_percent: f64,
    pub disk_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_free_gb: f64,
    pub disk_usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SkillsMetrics {
    pub total_skills: usize,
    pub ready_count: usize,
    pub error_count: usize,
    pub skills_by_status: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub performance: PerformanceMetrics,
    pub reliability: ReliabilityMetrics,
    pub usage: UsageMetrics,
    pub system: SystemMetrics,
    pub skills: SkillsMetrics,
    pub collection_time_ms: u64,
    pub collected_at: String,
}

/// A capability probe (§9 design note): a missing collaborator degrades
/// its sub-tree to zeros rather than failing the whole snapshot.
#[async_trait]
pub trait PerformanceSource: Send + Sync {
    async fn collect(&self) -> Result<PerformanceMetrics>;
}

#[async_trait]
pub trait ReliabilitySource: Send + Sync {
    async fn collect(&self) -> Result<ReliabilityMetrics>;
}

#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn collect(&self) -> Result<UsageMetrics>;
}

/// Local-machine probe; unlike the provider-telemetry sources this one has
/// no external dependency, so it is implemented concretely rather than
/// behind a trait.
pub struct SystemProbe;

impl SystemProbe {
    pub fn collect(&self) -> SystemMetrics {
        let mut sys = System::new_all();
        sys.refresh_all();

        let pid = sysinfo::get_current_pid().ok();
        let (memory_rss_mb, memory_percent) = pid
            .and_then(|pid| sys.process(pid))
            .map(|process| {
                let rss_mb = process.memory() as f64 / (1024.0 * 1024.0);
                let percent = if sys.total_memory() > 0 {
                    (process.memory() as f64 / sys.total_memory() as f64) * 100.0
                } else {
                    0.0
                };
                (rss_mb, percent)
            })
            .unwrap_or((0.0, 0.0));

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), disk| (t + disk.total_space(), a + disk.available_space()));
        let gb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let disk_total_gb = gb(total);
        let disk_free_gb = gb(available);
        let disk_used_gb = disk_total_gb - disk_free_gb;
        let disk_usage_percent = if disk_total_gb > 0.0 {
            (disk_used_gb / disk_total_gb) * 100.0
        } else {
            0.0
        };

        SystemMetrics {
            memory_rss_mb,
            memory_percent,
            disk_total_gb,
            disk_used_gb,
            disk_free_gb,
            disk_usage_percent,
        }
    }
}

/// Index `floor(n * 0.95)` of the ascending-sorted samples, clamped to `n - 1`.
pub fn p95(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx]
}

pub struct MetricsCollector {
    performance: Option<Arc<dyn PerformanceSource>>,
    reliability: Option<Arc<dyn ReliabilitySource>>,
    usage: Option<Arc<dyn UsageSource>>,
    system: SystemProbe,
    /// Held weakly: the registry owns no reference back, but a strong
    /// `Arc<SkillRegistry>` here would force the registry to be fully
    /// populated (including this collector's own caller) before it could
    /// ever be constructed.
    registry: Weak<SkillRegistry>,
}

impl MetricsCollector {
    /// Takes a `Weak` handle so the caller can construct this collector
    /// before the registry it observes is fully built (§4.F self-observation
    /// needs the real registry, not a throwaway stand-in — see `main.rs`,
    /// which resolves the cycle with `Arc::new_cyclic`).
    pub fn new(registry: Weak<SkillRegistry>) -> Self {
        Self {
            performance: None,
            reliability: None,
            usage: None,
            system: SystemProbe,
            registry,
        }
    }

    pub fn with_performance_source(mut self, source: Arc<dyn PerformanceSource>) -> Self {
        self.performance = Some(source);
        self
    }

    pub fn with_reliability_source(mut self, source: Arc<dyn ReliabilitySource>) -> Self {
        self.reliability = Some(source);
        self
    }

    pub fn with_usage_source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.usage = Some(source);
        self
    }

    /// Collect the full tree. Each source is guarded individually; a
    /// failing or absent source degrades to zeros and logs one warning.
    pub async fn collect(&self, collected_at: &str) -> MetricsSnapshot {
        let start = Instant::now();

        let performance = match &self.performance {
            Some(source) => source.collect().await.unwrap_or_else(|err| {
                warn!(error = %err, "performance source degraded, zero-filling");
                PerformanceMetrics::default()
            }),
            None => {
                warn!("no performance source configured, zero-filling");
                PerformanceMetrics::default()
            }
        };

        let reliability = match &self.reliability {
            Some(source) => source.collect().await.unwrap_or_else(|err| {
                warn!(error = %err, "reliability source degraded, zero-filling");
                ReliabilityMetrics::default()
            }),
            None => {
                warn!("no reliability source configured, zero-filling");
                ReliabilityMetrics::default()
            }
        };

        let usage = match &self.usage {
            Some(source) => source.collect().await.unwrap_or_else(|err| {
                warn!(error = %err, "usage source degraded, zero-filling");
                UsageMetrics::default()
            }),
            None => {
                warn!("no usage source configured, zero-filling");
                UsageMetrics::default()
            }
        };

        let system = self.system.collect();
        let skills = self.skills_metrics().await;

        MetricsSnapshot {
            performance,
            reliability,
            usage,
            system,
            skills,
            collection_time_ms: start.elapsed().as_millis() as u64,
            collected_at: collected_at.to_string(),
        }
    }

    async fn skills_metrics(&self) -> SkillsMetrics {
        let Some(registry) = self.registry.upgrade() else {
            return SkillsMetrics::default();
        };
        let summary = registry.get_status_summary().await;
        SkillsMetrics {
            total_skills: summary.total_skills,
            ready_count: summary.ready_count,
            error_count: summary.error_count,
            skills_by_status: summary.by_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p95_empty_is_zero() {
        assert_eq!(p95(&[]), 0.0);
    }

    #[test]
    fn p95_single_sample_is_itself() {
        assert_eq!(p95(&[42.0]), 42.0);
    }

    #[test]
    fn p95_matches_floor_index_rule() {
        let samples: Vec<f64> = (1..=20).map(|n| n as f64).collect();
        // floor(20 * 0.95) = 19 -> index 19 -> value 20.0, clamped to n-1 = 19 anyway
        assert_eq!(p95(&samples), 20.0);
    }

    #[test]
    fn p95_ignores_input_order() {
        let ascending: Vec<f64> = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let shuffled: Vec<f64> = vec![5.0, 2.0, 9.0, 1.0, 10.0, 3.0, 8.0, 4.0, 7.0, 6.0];
        assert_eq!(p95(&ascending), p95(&shuffled));
    }

    #[tokio::test]
    async fn collect_degrades_missing_sources_to_zero() {
        let registry = Arc::new(SkillRegistry::new(std::time::Duration::from_secs(5)));
        let collector = MetricsCollector::new(Arc::downgrade(&registry));
        let snapshot = collector.collect("2026-07-27T00:00:00Z").await;
        assert_eq!(snapshot.performance, PerformanceMetrics::default());
        assert_eq!(snapshot.reliability, ReliabilityMetrics::default());
        assert_eq!(snapshot.usage, UsageMetrics::default());
        assert_eq!(snapshot.skills.total_skills, 0);
    }
}
