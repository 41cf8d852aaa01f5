//! Health Analyzer Skill (component J): composes the Metrics Collector,
//! Health Analyzer, and Self-Healer into a single heartbeat participant.
//! No HTTP surface of its own — it is driven entirely by `on_heartbeat`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::health::analyzer::{self, AnalysisResult, DailyHealthReport};
use crate::health::collector::{MetricsCollector, MetricsSnapshot};
use crate::health::healer::SelfHealer;
use crate::permissions::{Permission, PermissionSet};
use crate::skills::{HeartbeatAction, Request, Response, Skill, SkillMetadata};

const ANALYSIS_EVERY_N_BEATS: u64 = 6;
const DAILY_REPORT_EVERY_N_BEATS: u64 = 288;
const BASELINE_HOURS: i64 = 24;
const CRITICAL_NOTIFICATION_PRIORITY: i32 = 9;

pub struct HealthAnalyzerSkill {
    metadata: SkillMetadata,
    db: Arc<Mutex<rusqlite::Connection>>,
    collector: Arc<MetricsCollector>,
    healer: Arc<SelfHealer>,
    owner_user_id: String,
    beat_count: AtomicU64,
}

impl HealthAnalyzerSkill {
    pub fn new(
        db: Arc<Mutex<rusqlite::Connection>>,
        collector: Arc<MetricsCollector>,
        healer: Arc<SelfHealer>,
        owner_user_id: impl Into<String>,
    ) -> Self {
        Self {
            metadata: SkillMetadata {
                name: "health_analyzer".to_string(),
                description: "Collects metrics snapshots, detects anomalies against a rolling baseline, and triggers self-healing.".to_string(),
                version: "1.0.0".to_string(),
                permissions: PermissionSet::from([Permission::ReadMetrics, Permission::TriggerHealing]),
                intents: vec!["get_health_status".to_string()],
            },
            db,
            collector,
            healer,
            owner_user_id: owner_user_id.into(),
            beat_count: AtomicU64::new(0),
        }
    }

    async fn persist_snapshot(&self, snapshot: &MetricsSnapshot) -> Option<i64> {
        let metrics_json = match serde_json::to_string(snapshot) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "failed to serialize metrics snapshot");
                return None;
            }
        };
        let db = self.db.lock().await;
        match db.execute(
            "INSERT INTO snapshots (collected_at, metrics_json) VALUES (?1, ?2)",
            params![snapshot.collected_at, metrics_json],
        ) {
            Ok(_) => Some(db.last_insert_rowid()),
            Err(err) => {
                error!(error = %err, "failed to persist metrics snapshot");
                None
            }
        }
    }

    async fn record_analysis(&self, snapshot_id: i64, analysis: &AnalysisResult) {
        let Ok(anomalies_json) = serde_json::to_string(analysis) else {
            return;
        };
        let db = self.db.lock().await;
        if let Err(err) = db.execute(
            "UPDATE snapshots SET anomalies_json = ?1 WHERE id = ?2",
            params![anomalies_json, snapshot_id],
        ) {
            warn!(error = %err, "failed to persist anomaly analysis");
        }
    }

    async fn fetch_baseline(&self, before: &str) -> Vec<serde_json::Value> {
        let db = self.db.lock().await;
        let mut stmt = match db.prepare(
            "SELECT metrics_json FROM snapshots
             WHERE collected_at < ?1 AND collected_at >= datetime(?1, ?2)
             ORDER BY collected_at DESC",
        ) {
            Ok(stmt) => stmt,
            Err(err) => {
                warn!(error = %err, "failed to prepare baseline query");
                return Vec::new();
            }
        };
        let window = format!("-{BASELINE_HOURS} hours");
        let rows = match stmt.query_map(params![before, window], |row| row.get::<_, String>(0)) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to run baseline query");
                return Vec::new();
            }
        };

        rows.filter_map(|r| r.ok())
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect()
    }

    async fn fetch_todays_snapshots(&self, date: &str) -> Vec<MetricsSnapshot> {
        let db = self.db.lock().await;
        let mut stmt = match db.prepare("SELECT metrics_json FROM snapshots WHERE collected_at LIKE ?1 ORDER BY collected_at") {
            Ok(stmt) => stmt,
            Err(err) => {
                warn!(error = %err, "failed to prepare daily report query");
                return Vec::new();
            }
        };
        let like = format!("{date}%");
        let rows = match stmt.query_map(params![like], |row| row.get::<_, String>(0)) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to run daily report query");
                return Vec::new();
            }
        };
        rows.filter_map(|r| r.ok())
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect()
    }

    async fn persist_daily_report(&self, report: &DailyHealthReport) {
        let Ok(deductions_json) = serde_json::to_string(&report.deductions) else {
            return;
        };
        let db = self.db.lock().await;
        if let Err(err) = db.execute(
            "INSERT INTO daily_reports (date, score, deductions) VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET score = excluded.score, deductions = excluded.deductions",
            params![report.date, report.score, deductions_json],
        ) {
            warn!(error = %err, "failed to persist daily health report");
        }
    }
}

#[async_trait]
impl Skill for HealthAnalyzerSkill {
    fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    async fn initialize(&self) -> bool {
        true
    }

    async fn handle(&self, request: &Request) -> Response {
        let db = self.db.lock().await;
        let latest: Option<String> = db
            .query_row(
                "SELECT metrics_json FROM snapshots ORDER BY collected_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        drop(db);

        match latest {
            Some(json) => match serde_json::from_str::<serde_json::Value>(&json) {
                Ok(value) => {
                    let mut data = HashMap::new();
                    data.insert("snapshot".to_string(), value);
                    Response::ok_with_data(request, "latest health snapshot", data)
                }
                Err(err) => Response::error(request, format!("corrupt snapshot: {err}")),
            },
            None => Response::error(request, "no snapshot collected yet"),
        }
    }

    async fn on_heartbeat(&self, _user_ids: &[String]) -> Vec<HeartbeatAction> {
        let beat = self.beat_count.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let snapshot = self.collector.collect(&now).await;
        let Some(snapshot_id) = self.persist_snapshot(&snapshot).await else {
            return Vec::new();
        };

        let mut actions = Vec::new();

        if beat % ANALYSIS_EVERY_N_BEATS == 0 {
            let baseline = self.fetch_baseline(&snapshot.collected_at).await;
            let current = match serde_json::to_value(&snapshot) {
                Ok(v) => v,
                Err(err) => {
                    error!(error = %err, "failed to convert snapshot to value for analysis");
                    return actions;
                }
            };
            let analysis = analyzer::analyze(&current, &baseline);
            self.record_analysis(snapshot_id, &analysis).await;

            if analysis.has_critical {
                let mut data = HashMap::new();
                data.insert(
                    "anomalies".to_string(),
                    serde_json::to_value(&analysis.anomalies).unwrap_or(serde_json::Value::Null),
                );
                actions.push(HeartbeatAction {
                    skill_name: self.metadata.name.clone(),
                    action_type: "send_message".to_string(),
                    user_id: self.owner_user_id.clone(),
                    data,
                    priority: CRITICAL_NOTIFICATION_PRIORITY,
                });
            }

            if !analysis.recommended_actions.is_empty() {
                self.healer.execute_recommended(&analysis.recommended_actions, "health_analyzer").await;
            }
        }

        if beat % DAILY_REPORT_EVERY_N_BEATS == 0 {
            let date = now.split(' ').next().unwrap_or(&now).to_string();
            let snapshots = self.fetch_todays_snapshots(&date).await;
            let report = analyzer::generate_daily_report(&date, &snapshots);
            self.persist_daily_report(&report).await;
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::SkillRegistry;
    use std::time::Duration;

    fn skill() -> HealthAnalyzerSkill {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::migrate(&conn).unwrap();
        let db = Arc::new(Mutex::new(conn));
        let registry = Arc::new(SkillRegistry::new(Duration::from_secs(5)));
        let collector = Arc::new(MetricsCollector::new(Arc::downgrade(&registry)));
        let healer = Arc::new(SelfHealer::new(db.clone(), Arc::downgrade(&registry), 300));
        HealthAnalyzerSkill::new(db, collector, healer, "owner-1")
    }

    #[tokio::test]
    async fn every_beat_persists_a_snapshot() {
        let skill = skill();
        skill.on_heartbeat(&[]).await;
        let db = skill.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn handle_returns_latest_snapshot() {
        let skill = skill();
        skill.on_heartbeat(&[]).await;
        let req = Request::new("u1", "get_health_status", "");
        let resp = skill.handle(&req).await;
        assert!(resp.success);
        assert!(resp.data.contains_key("snapshot"));
    }

    #[tokio::test]
    async fn handle_without_any_snapshot_errors() {
        let skill = skill();
        let req = Request::new("u1", "get_health_status", "");
        let resp = skill.handle(&req).await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn sixth_beat_runs_analysis_without_crashing_on_thin_baseline() {
        let skill = skill();
        for _ in 0..6 {
            skill.on_heartbeat(&[]).await;
        }
        let db = skill.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 6);
    }
}
