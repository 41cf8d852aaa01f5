//! Action Controller (component C): maps a `(user, domain, action)` policy
//! to an execute/draft/ask/block decision. The policy carries its own
//! trust_score, evolved by the same outcome→delta table as the Trust
//! Ledger (§4.B) but tracked independently per `(domain, action)` rather
//! than per `(reply_type, contact)` — the two components share a delta
//! table, not a ledger.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::trust::Outcome;

const GLOBAL_CAP: f64 = 0.95;
const DRAFT_AUTO_EXECUTE_THRESHOLD: f64 = 0.85;

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// The four modes a policy may be set to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Auto,
    Draft,
    Ask,
    Never,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyMode::Auto => "auto",
            PolicyMode::Draft => "draft",
            PolicyMode::Ask => "ask",
            PolicyMode::Never => "never",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(PolicyMode::Auto),
            "draft" => Ok(PolicyMode::Draft),
            "ask" => Ok(PolicyMode::Ask),
            "never" => Ok(PolicyMode::Never),
            other => Err(crate::error::AppError::Input(format!("unknown policy mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub user: String,
    pub domain: String,
    pub action: String,
    pub mode: PolicyMode,
    pub trust_score: f64,
}

/// What the controller decided, and the trust number or reason behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Execute { trust: f64 },
    Draft { trust: f64, execute: bool },
    Ask { trust: f64, reason: String },
    Never { trust: f64, reason: String },
}

impl Decision {
    /// Whether this decision authorizes unattended execution right now.
    pub fn should_execute(&self) -> bool {
        match self {
            Decision::Execute { .. } => true,
            Decision::Draft { execute, .. } => *execute,
            Decision::Ask { .. } | Decision::Never { .. } => false,
        }
    }
}

/// Stateless decision logic plus SQLite-backed policy storage (§4.M).
pub struct ActionController {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl ActionController {
    pub fn new(db: Arc<Mutex<rusqlite::Connection>>) -> Self {
        Self { db }
    }

    pub async fn get_policy(&self, user: &str, domain: &str, action: &str) -> Result<Option<Policy>> {
        let db = self.db.lock().await;
        let policy = db
            .query_row(
                "SELECT mode, trust_score FROM policies WHERE user_id = ?1 AND domain = ?2 AND action = ?3",
                params![user, domain, action],
                |row| {
                    let mode: String = row.get(0)?;
                    Ok((mode, row.get::<_, f64>(1)?))
                },
            )
            .optional()?;

        Ok(match policy {
            Some((mode, trust_score)) => Some(Policy {
                user: user.to_string(),
                domain: domain.to_string(),
                action: action.to_string(),
                mode: PolicyMode::parse(&mode)?,
                trust_score,
            }),
            None => None,
        })
    }

    pub async fn set_policy(&self, policy: &Policy) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO policies (user_id, domain, action, mode, trust_score)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, domain, action) DO UPDATE SET
                mode = excluded.mode,
                trust_score = excluded.trust_score",
            params![
                policy.user,
                policy.domain,
                policy.action,
                policy.mode.as_str(),
                policy.trust_score,
            ],
        )?;
        Ok(())
    }

    /// No policy defaults to `Ask` with zero trust — unknown domain/action
    /// pairs never execute unattended (§4.C).
    pub async fn decide(&self, user: &str, domain: &str, action: &str) -> Result<Decision> {
        let policy = self.get_policy(user, domain, action).await?;

        let Some(policy) = policy else {
            return Ok(Decision::Ask {
                trust: 0.0,
                reason: "no policy".to_string(),
            });
        };

        Ok(match policy.mode {
            PolicyMode::Never => Decision::Never {
                trust: policy.trust_score,
                reason: format!("policy for {domain}.{action} is never"),
            },
            PolicyMode::Ask => Decision::Ask {
                trust: policy.trust_score,
                reason: format!("policy for {domain}.{action} requires review"),
            },
            PolicyMode::Draft => Decision::Draft {
                trust: policy.trust_score,
                execute: policy.trust_score >= DRAFT_AUTO_EXECUTE_THRESHOLD,
            },
            PolicyMode::Auto => Decision::Execute {
                trust: policy.trust_score,
            },
        })
    }

    /// Feed a reviewed outcome back into the policy's own trust score,
    /// using the same delta table as the Trust Ledger (§4.B), clamped to
    /// `[0, 0.95]`. Creates an `ask`-mode policy at zero trust first if
    /// none existed yet, so a first-ever outcome has something to update.
    pub async fn record_outcome(&self, user: &str, domain: &str, action: &str, outcome: Outcome) -> Result<f64> {
        let mut policy = self.get_policy(user, domain, action).await?.unwrap_or(Policy {
            user: user.to_string(),
            domain: domain.to_string(),
            action: action.to_string(),
            mode: PolicyMode::Ask,
            trust_score: 0.0,
        });

        policy.trust_score = clamp(policy.trust_score + outcome.delta(), 0.0, GLOBAL_CAP);
        self.set_policy(&policy).await?;
        Ok(policy.trust_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn controller() -> ActionController {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate(&conn).unwrap();
        ActionController::new(Arc::new(Mutex::new(conn)))
    }

    #[tokio::test]
    async fn missing_policy_defaults_to_ask() {
        let controller = controller();
        let decision = controller.decide("u1", "email", "reply").await.unwrap();
        assert!(matches!(decision, Decision::Ask { .. }));
        assert!(!decision.should_execute());
    }

    #[tokio::test]
    async fn never_mode_always_blocks() {
        let controller = controller();
        controller
            .set_policy(&Policy {
                user: "u1".into(),
                domain: "email".into(),
                action: "reply".into(),
                mode: PolicyMode::Never,
                trust_score: 0.9,
            })
            .await
            .unwrap();
        let decision = controller.decide("u1", "email", "reply").await.unwrap();
        assert!(matches!(decision, Decision::Never { .. }));
        assert!(!decision.should_execute());
    }

    #[tokio::test]
    async fn auto_mode_always_executes() {
        let controller = controller();
        controller
            .set_policy(&Policy {
                user: "u1".into(),
                domain: "email".into(),
                action: "reply".into(),
                mode: PolicyMode::Auto,
                trust_score: 0.0,
            })
            .await
            .unwrap();
        let decision = controller.decide("u1", "email", "reply").await.unwrap();
        assert!(matches!(decision, Decision::Execute { .. }));
        assert!(decision.should_execute());
    }

    #[tokio::test]
    async fn draft_mode_executes_only_once_trust_clears_threshold() {
        let controller = controller();
        controller
            .set_policy(&Policy {
                user: "u1".into(),
                domain: "email".into(),
                action: "reply".into(),
                mode: PolicyMode::Draft,
                trust_score: 0.0,
            })
            .await
            .unwrap();
        let decision = controller.decide("u1", "email", "reply").await.unwrap();
        assert!(matches!(decision, Decision::Draft { execute: false, .. }));

        for _ in 0..20 {
            controller.record_outcome("u1", "email", "reply", Outcome::Approved).await.unwrap();
        }
        let decision = controller.decide("u1", "email", "reply").await.unwrap();
        assert!(matches!(decision, Decision::Draft { execute: true, .. }));
    }

    #[tokio::test]
    async fn record_outcome_clamps_to_global_cap() {
        let controller = controller();
        let mut last = 0.0;
        for _ in 0..50 {
            last = controller.record_outcome("u1", "email", "reply", Outcome::Approved).await.unwrap();
        }
        assert!(last <= 0.95);
    }

    #[tokio::test]
    async fn record_outcome_never_goes_below_zero() {
        let controller = controller();
        let mut last = 0.0;
        for _ in 0..20 {
            last = controller.record_outcome("u1", "email", "reply", Outcome::Rejected).await.unwrap();
        }
        assert!(last >= 0.0);
    }

    #[tokio::test]
    async fn record_outcome_creates_ask_policy_from_nothing() {
        let controller = controller();
        controller.record_outcome("u1", "email", "reply", Outcome::Approved).await.unwrap();
        let policy = controller.get_policy("u1", "email", "reply").await.unwrap().unwrap();
        assert_eq!(policy.mode, PolicyMode::Ask);
        assert!((policy.trust_score - 0.05).abs() < 1e-9);
    }
}
