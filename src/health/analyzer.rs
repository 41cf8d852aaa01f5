//! Health Analyzer (component G): stateless z-score anomaly detection
//! against a rolling baseline, plus the daily health score report.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::health::collector::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub path: String,
    pub current: f64,
    pub mean: f64,
    pub stddev: f64,
    pub z_score: f64,
    pub severity: AnomalySeverity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub anomalies: Vec<Anomaly>,
    pub has_critical: bool,
    pub recommended_actions: Vec<String>,
}

const MIN_BASELINE_SNAPSHOTS: usize = 5;
const MIN_HISTORY_PER_PATH: usize = 5;

/// Flatten a JSON-like metrics tree to `dotted.path -> value` for every
/// numeric leaf. Non-numeric leaves (strings, arrays, objects with no
/// numeric descendants) are skipped.
fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, f64>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.insert(prefix.to_string(), f);
            }
        }
        Value::Object(map) => {
            for (key, v) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, v, out);
            }
        }
        _ => {}
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (`pstdev`), matching the spec's baseline
/// statistic rather than a sample-corrected variant.
fn pstdev(values: &[f64], mean_value: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean_value).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn recommend_for_path(path: &str, z: f64) -> Option<&'static str> {
    if path.contains("error_rate") {
        Some("restart_skill")
    } else if path.contains("rate_limit") {
        Some("adjust_rate_limits")
    } else if path.contains("memory") && z > 0.0 {
        Some("clear_stale_connections")
    } else if path.contains("skill_failure") || path.contains("skill_error") {
        Some("restart_skill")
    } else if path.contains("latency") && z > 0.0 {
        Some("warm_llm_models")
    } else {
        None
    }
}

/// Compare `current`'s metrics tree against `baseline` (typically the last
/// 24h of snapshots). Returns an empty result if the baseline is too thin.
pub fn analyze(current: &Value, baseline: &[Value]) -> AnalysisResult {
    if baseline.len() < MIN_BASELINE_SNAPSHOTS {
        return AnalysisResult::default();
    }

    let mut current_flat = HashMap::new();
    flatten("", current, &mut current_flat);

    let mut history: HashMap<String, Vec<f64>> = HashMap::new();
    for snapshot in baseline {
        let mut flat = HashMap::new();
        flatten("", snapshot, &mut flat);
        for (path, value) in flat {
            history.entry(path).or_default().push(value);
        }
    }

    let mut anomalies = Vec::new();
    let mut current_paths: Vec<_> = current_flat.keys().cloned().collect();
    current_paths.sort();

    for path in current_paths {
        let current_value = current_flat[&path];
        let Some(values) = history.get(&path) else { continue };
        if values.len() < MIN_HISTORY_PER_PATH {
            continue;
        }

        let m = mean(values);
        let stddev = pstdev(values, m);

        let (z, severity) = if stddev == 0.0 {
            if current_value == m {
                continue;
            }
            (f64::INFINITY, AnomalySeverity::Warning)
        } else {
            let z = (current_value - m) / stddev;
            if z.abs() >= 3.0 {
                (z, AnomalySeverity::Critical)
            } else if z.abs() >= 2.0 {
                (z, AnomalySeverity::Warning)
            } else {
                continue;
            }
        };

        anomalies.push(Anomaly {
            path,
            current: current_value,
            mean: m,
            stddev,
            z_score: z,
            severity,
        });
    }

    let has_critical = anomalies.iter().any(|a| a.severity == AnomalySeverity::Critical);

    let mut recommended_actions = Vec::new();
    for anomaly in &anomalies {
        if let Some(action) = recommend_for_path(&anomaly.path, anomaly.z_score) {
            if !recommended_actions.iter().any(|a: &String| a == action) {
                recommended_actions.push(action.to_string());
            }
        }
    }

    AnalysisResult {
        anomalies,
        has_critical,
        recommended_actions,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyHealthReport {
    pub date: String,
    pub score: f64,
    pub deductions: HashMap<String, f64>,
}

/// Compute the daily health score: 100 minus capped deductions for error
/// rate, rate-limit events, skill errors, and excess memory use.
pub fn generate_daily_report(date: &str, snapshots: &[MetricsSnapshot]) -> DailyHealthReport {
    let mut deductions: HashMap<String, f64> = HashMap::new();

    if snapshots.is_empty() {
        deductions.insert("missing_data".to_string(), 5.0);
        let total: f64 = deductions.values().sum();
        return DailyHealthReport {
            date: date.to_string(),
            score: (100.0 - total).clamp(0.0, 100.0),
            deductions,
        };
    }

    let error_rates: Vec<f64> = snapshots
        .iter()
        .flat_map(|s| s.reliability.error_rate_by_provider.values().copied())
        .collect();
    if !error_rates.is_empty() {
        let avg_error_rate = mean(&error_rates);
        let deduction = (avg_error_rate * 300.0).min(30.0);
        if deduction > 0.0 {
            deductions.insert("error_rate".to_string(), deduction);
        }
    } else {
        deductions.insert("missing_data".to_string(), 5.0);
    }

    let rate_limit_events: u64 = snapshots.iter().map(|s| s.reliability.rate_limit_count).sum();
    let rate_limit_deduction = (rate_limit_events as f64 * 2.0).min(20.0);
    if rate_limit_deduction > 0.0 {
        deductions.insert("rate_limit".to_string(), rate_limit_deduction);
    }

    let max_skill_errors = snapshots.iter().map(|s| s.skills.error_count as f64).fold(0.0, f64::max);
    let skill_error_deduction = (max_skill_errors * 5.0).min(20.0);
    if skill_error_deduction > 0.0 {
        deductions.insert("skill_errors".to_string(), skill_error_deduction);
    }

    let max_memory = snapshots.iter().map(|s| s.system.memory_rss_mb).fold(0.0, f64::max);
    if max_memory > 1024.0 {
        let deduction = ((max_memory - 1024.0) / 100.0).min(10.0);
        deductions.insert("memory".to_string(), deduction);
    }

    let total_deduction: f64 = deductions.values().sum();
    let score = ((100.0 - total_deduction) * 10.0).round() / 10.0;

    DailyHealthReport {
        date: date.to_string(),
        score: score.clamp(0.0, 100.0),
        deductions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_baseline_returns_empty_result() {
        let current = json!({"performance": {"avg_latency_ms": {"claude": 500.0}}});
        let result = analyze(&current, &[]);
        assert!(result.anomalies.is_empty());
        assert!(!result.has_critical);
    }

    #[test]
    fn detects_critical_latency_spike() {
        let baseline: Vec<Value> = (0..10)
            .map(|_| json!({"performance": {"avg_latency_ms": {"claude": 100.0}}}))
            .collect();
        let current = json!({"performance": {"avg_latency_ms": {"claude": 900.0}}});
        let result = analyze(&current, &baseline);
        assert!(result.has_critical);
        assert!(result.recommended_actions.contains(&"warm_llm_models".to_string()));
    }

    #[test]
    fn zero_stddev_with_matching_value_is_not_anomalous() {
        let baseline: Vec<Value> = (0..10).map(|_| json!({"usage": {"total_tokens_input": 100.0}})).collect();
        let current = json!({"usage": {"total_tokens_input": 100.0}});
        let result = analyze(&current, &baseline);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn zero_stddev_with_different_value_is_warning() {
        let baseline: Vec<Value> = (0..10).map(|_| json!({"usage": {"total_tokens_input": 100.0}})).collect();
        let current = json!({"usage": {"total_tokens_input": 150.0}});
        let result = analyze(&current, &baseline);
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].severity, AnomalySeverity::Warning);
        assert!(result.anomalies[0].z_score.is_infinite());
    }

    #[test]
    fn thin_history_for_a_path_is_skipped() {
        let mut baseline = vec![json!({"performance": {"avg_latency_ms": {"claude": 100.0}}}); 4];
        baseline.push(json!({}));
        let current = json!({"performance": {"avg_latency_ms": {"claude": 900.0}}});
        let result = analyze(&current, &baseline);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn recommendations_are_deduped_preserving_first_occurrence() {
        let baseline: Vec<Value> = (0..10)
            .map(|_| {
                json!({"reliability": {"skill_failure_count": 0.0, "skill_error_names_count": 0.0}})
            })
            .collect();
        let current = json!({"reliability": {"skill_failure_count": 9.0, "skill_error_names_count": 9.0}});
        let result = analyze(&current, &baseline);
        let restart_count = result.recommended_actions.iter().filter(|a| *a == "restart_skill").count();
        assert_eq!(restart_count, 1);
    }

    #[test]
    fn daily_report_score_starts_at_100_with_no_issues() {
        let report = generate_daily_report("2026-07-27", &[]);
        assert!(report.score <= 100.0);
    }

    #[test]
    fn daily_report_deducts_for_high_memory() {
        let mut snapshot = sample_snapshot();
        snapshot.system.memory_rss_mb = 1224.0;
        let report = generate_daily_report("2026-07-27", &[snapshot]);
        assert!(report.deductions.contains_key("memory"));
        assert!((report.deductions["memory"] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn daily_report_caps_rate_limit_deduction() {
        let mut snapshot = sample_snapshot();
        snapshot.reliability.rate_limit_count = 1000;
        let report = generate_daily_report("2026-07-27", &[snapshot]);
        assert_eq!(report.deductions["rate_limit"], 20.0);
    }

    fn sample_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            performance: Default::default(),
            reliability: crate::health::collector::ReliabilityMetrics {
                error_rate_by_provider: HashMap::from([("claude".to_string(), 0.01)]),
                ..Default::default()
            },
            usage: Default::default(),
            system: Default::default(),
            skills: Default::default(),
            collection_time_ms: 0,
            collected_at: "2026-07-27T00:00:00Z".to_string(),
        }
    }
}
