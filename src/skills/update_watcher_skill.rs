//! Update Watcher Skill (component K): periodic version check against an
//! external release oracle, with optional auto-apply and post-apply health
//! validation (rolling back on failure).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::params;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::permissions::{Permission, PermissionSet};
use crate::skills::{HeartbeatAction, Request, Response, Skill, SkillMetadata};

const CHECK_EVERY_N_BEATS: u64 = 6;
const VALIDATION_MAX_ATTEMPTS: u32 = 6;
const VALIDATION_RETRY_DELAY: Duration = Duration::from_secs(10);

const NOTIFY_AVAILABLE_PRIORITY: i32 = 7;
const NOTIFY_APPLIED_PRIORITY: i32 = 8;
const NOTIFY_FAILED_PRIORITY: i32 = 9;

/// External release oracle (out of scope per §1: concrete HTTP glue for a
/// specific update channel is not implemented here).
#[async_trait]
pub trait ReleaseOracle: Send + Sync {
    async fn latest_version(&self) -> Result<Option<String>>;
}

/// Applies and reverts an update. Concrete subprocess/update-manager glue
/// is out of scope; this crate depends only on the trait.
#[async_trait]
pub trait UpdateApplier: Send + Sync {
    async fn apply_update(&self, version: &str) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Post-apply health probe consulted by the retry loop.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<bool>;
}

/// Compare two `major.minor.patch`-style version strings. Unparsable
/// segments compare as 0, which is conservative: a malformed current
/// version never blocks an otherwise well-formed newer one.
fn is_newer(candidate: &str, current: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    }
    let (c, cur) = (parts(candidate), parts(current));
    for i in 0..c.len().max(cur.len()) {
        let a = c.get(i).copied().unwrap_or(0);
        let b = cur.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    false
}

pub struct UpdateWatcherSkill {
    metadata: SkillMetadata,
    db: Arc<Mutex<rusqlite::Connection>>,
    oracle: Option<Arc<dyn ReleaseOracle>>,
    applier: Option<Arc<dyn UpdateApplier>>,
    health_check: Option<Arc<dyn HealthCheck>>,
    auto_apply: bool,
    owner_user_id: String,
    current_version: String,
    pending_release: Mutex<Option<String>>,
    beat_count: AtomicU64,
}

impl UpdateWatcherSkill {
    pub fn new(
        db: Arc<Mutex<rusqlite::Connection>>,
        auto_apply: bool,
        owner_user_id: impl Into<String>,
        current_version: impl Into<String>,
    ) -> Self {
        Self {
            metadata: SkillMetadata {
                name: "update_watcher".to_string(),
                description: "Watches for new releases and optionally applies them with post-apply validation.".to_string(),
                version: "1.0.0".to_string(),
                permissions: PermissionSet::from([Permission::TriggerHealing]),
                intents: vec!["apply_update".to_string(), "check_for_updates".to_string()],
            },
            db,
            oracle: None,
            applier: None,
            health_check: None,
            auto_apply,
            owner_user_id: owner_user_id.into(),
            current_version: current_version.into(),
            pending_release: Mutex::new(None),
            beat_count: AtomicU64::new(0),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ReleaseOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn UpdateApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    async fn record_history(&self, version: &str, outcome: &str, details: &str) {
        let db = self.db.lock().await;
        if let Err(err) = db.execute(
            "INSERT INTO update_history (version, outcome, details) VALUES (?1, ?2, ?3)",
            params![version, outcome, details],
        ) {
            warn!(error = %err, "failed to record update history");
        }
    }

    fn notify(&self, priority: i32, action_type: &str, version: &str, detail: &str) -> HeartbeatAction {
        let mut data = std::collections::HashMap::new();
        data.insert("version".to_string(), serde_json::Value::String(version.to_string()));
        data.insert("detail".to_string(), serde_json::Value::String(detail.to_string()));
        HeartbeatAction {
            skill_name: self.metadata.name.clone(),
            action_type: action_type.to_string(),
            user_id: self.owner_user_id.clone(),
            data,
            priority,
        }
    }

    /// Up to [`VALIDATION_MAX_ATTEMPTS`] attempts, [`VALIDATION_RETRY_DELAY`]
    /// apart. Returns `true` on first success, `false` if the budget is
    /// exhausted without one.
    async fn validate_after_apply(&self) -> bool {
        let Some(check) = &self.health_check else {
            return true;
        };
        for attempt in 1..=VALIDATION_MAX_ATTEMPTS {
            match check.check().await {
                Ok(true) => return true,
                Ok(false) => warn!(attempt, "post-apply health check reported unhealthy"),
                Err(err) => warn!(attempt, error = %err, "post-apply health check failed"),
            }
            if attempt < VALIDATION_MAX_ATTEMPTS {
                tokio::time::sleep(VALIDATION_RETRY_DELAY).await;
            }
        }
        false
    }

    async fn apply_and_validate(&self, version: &str) -> Vec<HeartbeatAction> {
        let Some(applier) = &self.applier else {
            return vec![self.notify(NOTIFY_FAILED_PRIORITY, "update_failed", version, "no update applier configured")];
        };

        if let Err(err) = applier.apply_update(version).await {
            let detail = err.to_string();
            self.record_history(version, "apply_failed", &detail).await;
            return vec![self.notify(NOTIFY_FAILED_PRIORITY, "update_failed", version, &detail)];
        }

        if self.validate_after_apply().await {
            self.record_history(version, "applied", "post-apply validation succeeded").await;
            *self.pending_release.lock().await = None;
            vec![self.notify(NOTIFY_APPLIED_PRIORITY, "update_applied", version, "post-apply validation succeeded")]
        } else {
            let rollback_detail = match applier.rollback().await {
                Ok(()) => "validation failed, rolled back".to_string(),
                Err(err) => format!("validation failed and rollback also failed: {err}"),
            };
            self.record_history(version, "rolled_back", &rollback_detail).await;
            vec![self.notify(NOTIFY_FAILED_PRIORITY, "update_rolled_back", version, &rollback_detail)]
        }
    }
}

#[async_trait]
impl Skill for UpdateWatcherSkill {
    fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    async fn initialize(&self) -> bool {
        true
    }

    async fn handle(&self, request: &Request) -> Response {
        match request.intent.as_str() {
            "check_for_updates" => {
                let pending = self.pending_release.lock().await.clone();
                match pending {
                    Some(version) => Response::ok(request, format!("update {version} pending")),
                    None => Response::ok(request, "no pending update"),
                }
            }
            "apply_update" => {
                let pending = self.pending_release.lock().await.clone();
                match pending {
                    Some(version) => {
                        self.apply_and_validate(&version).await;
                        Response::ok(request, format!("applied {version}"))
                    }
                    None => Response::error(request, "no pending update to apply"),
                }
            }
            other => Response::error(request, format!("unsupported intent '{other}'")),
        }
    }

    async fn on_heartbeat(&self, _user_ids: &[String]) -> Vec<HeartbeatAction> {
        let beat = self.beat_count.fetch_add(1, Ordering::SeqCst) + 1;
        if beat % CHECK_EVERY_N_BEATS != 0 {
            return Vec::new();
        }

        let Some(oracle) = &self.oracle else {
            return Vec::new();
        };

        let latest = match oracle.latest_version().await {
            Ok(Some(v)) => v,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(error = %err, "release oracle check failed");
                return Vec::new();
            }
        };

        if !is_newer(&latest, &self.current_version) {
            return Vec::new();
        }

        *self.pending_release.lock().await = Some(latest.clone());
        info!(version = %latest, "newer release detected");

        if !self.auto_apply {
            return vec![self.notify(NOTIFY_AVAILABLE_PRIORITY, "update_available", &latest, "auto-apply disabled")];
        }

        self.apply_and_validate(&latest).await
    }
}
