//! Self-Healer (component H): a fixed catalogue of in-process recovery
//! actions, each cooldown-gated and always audited.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::skills::SkillRegistry;

/// Closed catalogue of healing actions (§4.H). Never a subprocess or
/// container restart — every action is an in-process operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealingActionType {
    RestartSkill,
    ClearStaleConnections,
    VacuumDatabases,
    WarmLlmModels,
    AdjustRateLimits,
    FlushLogBuffer,
}

impl HealingActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            HealingActionType::RestartSkill => "restart_skill",
            HealingActionType::ClearStaleConnections => "clear_stale_connections",
            HealingActionType::VacuumDatabases => "vacuum_databases",
            HealingActionType::WarmLlmModels => "warm_llm_models",
            HealingActionType::AdjustRateLimits => "adjust_rate_limits",
            HealingActionType::FlushLogBuffer => "flush_log_buffer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "restart_skill" => Some(HealingActionType::RestartSkill),
            "clear_stale_connections" => Some(HealingActionType::ClearStaleConnections),
            "vacuum_databases" => Some(HealingActionType::VacuumDatabases),
            "warm_llm_models" => Some(HealingActionType::WarmLlmModels),
            "adjust_rate_limits" => Some(HealingActionType::AdjustRateLimits),
            "flush_log_buffer" => Some(HealingActionType::FlushLogBuffer),
            _ => None,
        }
    }
}

/// The configured connection pool. `clear_stale_connections` expires every
/// live connection in it.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn expire_all(&self) -> Result<u64>;
}

/// Storage compaction/analyze collaborator for `vacuum_databases`.
#[async_trait]
pub trait DatabaseMaintenance: Send + Sync {
    async fn vacuum_and_analyze(&self) -> Result<()>;
}

/// `warm_llm_models` sends a minimal keep-alive request per loaded model.
#[async_trait]
pub trait ModelWarmer: Send + Sync {
    async fn loaded_models(&self) -> Result<Vec<String>>;
    async fn keep_alive(&self, model: &str) -> Result<()>;
}

/// `adjust_rate_limits` doubles the scheduler interval (capped) and
/// persists the new value via settings.
#[async_trait]
pub trait RateLimitAdjuster: Send + Sync {
    async fn current_interval_seconds(&self) -> Result<u64>;
    async fn set_interval_seconds(&self, seconds: u64) -> Result<()>;
}

/// `flush_log_buffer` force-flushes every registered log sink.
pub trait LogFlusher: Send + Sync {
    fn flush_all(&self);
}

const MAX_ADJUSTED_INTERVAL_SECONDS: u64 = 1800;

pub struct SelfHealer {
    db: Arc<Mutex<rusqlite::Connection>>,
    /// Weak: see the matching note on `MetricsCollector::registry`.
    registry: Weak<SkillRegistry>,
    cooldown_seconds: i64,
    enabled: HashMap<HealingActionType, bool>,
    connection_pool: Option<Arc<dyn ConnectionPool>>,
    database_maintenance: Option<Arc<dyn DatabaseMaintenance>>,
    model_warmer: Option<Arc<dyn ModelWarmer>>,
    rate_limit_adjuster: Option<Arc<dyn RateLimitAdjuster>>,
    log_flusher: Option<Arc<dyn LogFlusher>>,
}

impl SelfHealer {
    /// Takes a `Weak` handle for the same reason as `MetricsCollector::new`:
    /// the real registry (the one `restart_skill` must search) is not fully
    /// built yet at construction time.
    pub fn new(db: Arc<Mutex<rusqlite::Connection>>, registry: Weak<SkillRegistry>, cooldown_seconds: i64) -> Self {
        Self {
            db,
            registry,
            cooldown_seconds,
            enabled: HashMap::new(),
            connection_pool: None,
            database_maintenance: None,
            model_warmer: None,
            rate_limit_adjuster: None,
            log_flusher: None,
        }
    }

    pub fn with_connection_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.connection_pool = Some(pool);
        self
    }

    pub fn with_database_maintenance(mut self, maintenance: Arc<dyn DatabaseMaintenance>) -> Self {
        self.database_maintenance = Some(maintenance);
        self
    }

    pub fn with_model_warmer(mut self, warmer: Arc<dyn ModelWarmer>) -> Self {
        self.model_warmer = Some(warmer);
        self
    }

    pub fn with_rate_limit_adjuster(mut self, adjuster: Arc<dyn RateLimitAdjuster>) -> Self {
        self.rate_limit_adjuster = Some(adjuster);
        self
    }

    pub fn with_log_flusher(mut self, flusher: Arc<dyn LogFlusher>) -> Self {
        self.log_flusher = Some(flusher);
        self
    }

    pub fn disable(&mut self, action: HealingActionType) {
        self.enabled.insert(action, false);
    }

    /// Dispatch every action in `actions`, in declaration order. Unknown
    /// names map to `false` without being audited.
    pub async fn execute_recommended(&self, actions: &[String], trigger: &str) -> HashMap<String, bool> {
        let mut results = HashMap::with_capacity(actions.len());
        for action in actions {
            let Some(kind) = HealingActionType::parse(action) else {
                results.insert(action.clone(), false);
                continue;
            };
            let ok = self.execute(kind, trigger).await;
            results.insert(action.to_string(), ok);
        }
        results
    }

    pub async fn execute(&self, action: HealingActionType, trigger: &str) -> bool {
        if !*self.enabled.get(&action).unwrap_or(&true) {
            return false;
        }

        if self.on_cooldown(action).await {
            return false;
        }

        let outcome = self.perform(action).await;
        let (result, details) = match &outcome {
            Ok(details) => ("success", details.clone()),
            Err(err) => ("failure", err.to_string()),
        };
        self.audit(action, trigger, result, &details).await;
        outcome.is_ok()
    }

    async fn on_cooldown(&self, action: HealingActionType) -> bool {
        let db = self.db.lock().await;
        let last: Option<String> = db
            .query_row(
                "SELECT created_at FROM healing_actions WHERE action_type = ?1 ORDER BY created_at DESC LIMIT 1",
                params![action.as_str()],
                |row| row.get(0),
            )
            .ok();

        let Some(last) = last else { return false };
        let Ok(last_at) = chrono::NaiveDateTime::parse_from_str(&last, "%Y-%m-%d %H:%M:%S") else {
            return false;
        };
        let elapsed = Utc::now().signed_duration_since(last_at.and_utc()).num_seconds();
        elapsed < self.cooldown_seconds
    }

    async fn perform(&self, action: HealingActionType) -> Result<String> {
        match action {
            HealingActionType::RestartSkill => {
                let Some(registry) = self.registry.upgrade() else {
                    return Ok("skill registry no longer available".to_string());
                };
                match registry.first_errored().await {
                    Some(name) => {
                        let ok = registry.restart(&name).await;
                        if ok {
                            Ok(format!("restarted '{name}'"))
                        } else {
                            Err(crate::error::AppError::SkillRuntime(format!("restart of '{name}' failed")))
                        }
                    }
                    None => Ok("no errored skill found".to_string()),
                }
            }
            HealingActionType::ClearStaleConnections => match &self.connection_pool {
                Some(pool) => pool.expire_all().await.map(|n| format!("expired {n} connections")),
                None => Ok("no connection pool configured".to_string()),
            },
            HealingActionType::VacuumDatabases => match &self.database_maintenance {
                Some(maintenance) => maintenance.vacuum_and_analyze().await.map(|_| "vacuum complete".to_string()),
                None => Ok("no database maintenance collaborator configured".to_string()),
            },
            HealingActionType::WarmLlmModels => match &self.model_warmer {
                Some(warmer) => {
                    let models = warmer.loaded_models().await?;
                    for model in &models {
                        warmer.keep_alive(model).await?;
                    }
                    Ok(format!("warmed {} models", models.len()))
                }
                None => Ok("no model warmer configured".to_string()),
            },
            HealingActionType::AdjustRateLimits => match &self.rate_limit_adjuster {
                Some(adjuster) => {
                    let current = adjuster.current_interval_seconds().await?;
                    let doubled = (current * 2).min(MAX_ADJUSTED_INTERVAL_SECONDS);
                    adjuster.set_interval_seconds(doubled).await?;
                    Ok(format!("interval {current}s -> {doubled}s"))
                }
                None => Ok("no rate limit adjuster configured".to_string()),
            },
            HealingActionType::FlushLogBuffer => {
                if let Some(flusher) = &self.log_flusher {
                    flusher.flush_all();
                }
                Ok("flushed".to_string())
            }
        }
    }

    async fn audit(&self, action: HealingActionType, trigger: &str, result: &str, details: &str) {
        let db = self.db.lock().await;
        if let Err(err) = db.execute(
            "INSERT INTO healing_actions (action_type, trigger, result, details) VALUES (?1, ?2, ?3, ?4)",
            params![action.as_str(), trigger, result, details],
        ) {
            warn!(error = %err, action = action.as_str(), "failed to write healing audit entry");
        } else {
            info!(action = action.as_str(), result, "healing action audited");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::time::Duration;

    fn healer() -> SelfHealer {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate(&conn).unwrap();
        let registry = Arc::new(SkillRegistry::new(Duration::from_secs(5)));
        SelfHealer::new(Arc::new(Mutex::new(conn)), Arc::downgrade(&registry), 300)
    }

    #[tokio::test]
    async fn disabled_action_returns_false_without_audit() {
        let mut healer = healer();
        healer.disable(HealingActionType::FlushLogBuffer);
        let ok = healer.execute(HealingActionType::FlushLogBuffer, "test").await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn unconfigured_collaborator_still_succeeds_as_noop() {
        let healer = healer();
        let ok = healer.execute(HealingActionType::ClearStaleConnections, "test").await;
        assert!(ok);
    }

    #[tokio::test]
    async fn second_call_within_cooldown_is_rejected() {
        let healer = healer();
        let first = healer.execute(HealingActionType::FlushLogBuffer, "test").await;
        let second = healer.execute(HealingActionType::FlushLogBuffer, "test").await;
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn every_attempt_is_audited_regardless_of_outcome() {
        let healer = healer();
        healer.execute(HealingActionType::FlushLogBuffer, "test").await;
        let db = healer.db.lock().await;
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM healing_actions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unknown_action_name_maps_to_false() {
        let healer = healer();
        let results = healer
            .execute_recommended(&["not_a_real_action".to_string()], "test")
            .await;
        assert_eq!(results.get("not_a_real_action"), Some(&false));
    }

    #[tokio::test]
    async fn restart_skill_with_no_errored_skill_is_a_noop_success() {
        let healer = healer();
        let ok = healer.execute(HealingActionType::RestartSkill, "test").await;
        assert!(ok);
    }
}
