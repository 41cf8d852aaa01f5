//! Trust Ledger (component B): two independent ledgers — by reply-type and
//! by contact — yielding an effective trust for a send/no-send decision.

pub mod action_controller;

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};

/// Outcome of a reviewed auto-generated action, feeding both the trust
/// ledger (§4.B) and the action controller (§4.C) through the same delta table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Approved,
    MinorEdit,
    MajorEdit,
    Rejected,
}

impl Outcome {
    /// Fixed outcome→delta table (§4.B).
    pub fn delta(self) -> f64 {
        match self {
            Outcome::Approved => 0.05,
            Outcome::MinorEdit => -0.02,
            Outcome::MajorEdit => -0.10,
            Outcome::Rejected => -0.20,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "approved" => Ok(Outcome::Approved),
            "minor_edit" => Ok(Outcome::MinorEdit),
            "major_edit" => Ok(Outcome::MajorEdit),
            "rejected" => Ok(Outcome::Rejected),
            other => Err(AppError::Input(format!("unknown outcome '{other}'"))),
        }
    }
}

/// Closed set of reply types, each with a fixed trust ceiling (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyType {
    Acknowledgment,
    MeetingConfirm,
    MeetingDecline,
    InfoRequest,
    TaskUpdate,
    General,
    Negotiation,
    Sensitive,
}

impl ReplyType {
    pub fn ceiling(self) -> f64 {
        match self {
            ReplyType::Acknowledgment => 0.95,
            ReplyType::MeetingConfirm => 0.90,
            ReplyType::MeetingDecline => 0.80,
            ReplyType::InfoRequest => 0.75,
            ReplyType::TaskUpdate => 0.70,
            ReplyType::General => 0.60,
            ReplyType::Negotiation => 0.50,
            ReplyType::Sensitive => 0.30,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplyType::Acknowledgment => "acknowledgment",
            ReplyType::MeetingConfirm => "meeting_confirm",
            ReplyType::MeetingDecline => "meeting_decline",
            ReplyType::InfoRequest => "info_request",
            ReplyType::TaskUpdate => "task_update",
            ReplyType::General => "general",
            ReplyType::Negotiation => "negotiation",
            ReplyType::Sensitive => "sensitive",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "acknowledgment" => Ok(ReplyType::Acknowledgment),
            "meeting_confirm" => Ok(ReplyType::MeetingConfirm),
            "meeting_decline" => Ok(ReplyType::MeetingDecline),
            "info_request" => Ok(ReplyType::InfoRequest),
            "task_update" => Ok(ReplyType::TaskUpdate),
            "general" => Ok(ReplyType::General),
            "negotiation" => Ok(ReplyType::Negotiation),
            "sensitive" => Ok(ReplyType::Sensitive),
            other => Err(AppError::Input(format!("unknown reply type '{other}'"))),
        }
    }
}

/// A ledger row. Absent rows are represented by [`TrustScore::zero`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub score: f64,
    pub approvals: u64,
    pub rejections: u64,
    pub edits: u64,
    pub total_interactions: u64,
}

impl TrustScore {
    pub fn zero() -> Self {
        Self {
            score: 0.0,
            approvals: 0,
            rejections: 0,
            edits: 0,
            total_interactions: 0,
        }
    }

    /// `approvals / total_interactions`, or `0.0` when there have been none.
    pub fn approval_rate(&self) -> f64 {
        if self.total_interactions == 0 {
            0.0
        } else {
            self.approvals as f64 / self.total_interactions as f64
        }
    }
}

const GLOBAL_CAP: f64 = 0.95;

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// SQLite-backed implementation of the `PersonalStore` trust contract
/// (§4.M). Each `(user, kind, key)` row is read-modify-written inside one
/// transaction so the score update and the counter increments are atomic.
pub struct TrustLedger {
    db: Arc<Mutex<Connection>>,
}

impl TrustLedger {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn get_type_trust(&self, user: &str, reply_type: ReplyType) -> Result<TrustScore> {
        self.get_row(user, "type", reply_type.as_str()).await
    }

    pub async fn get_contact_trust(&self, user: &str, contact: &str) -> Result<TrustScore> {
        self.get_row(user, "contact", contact).await
    }

    async fn get_row(&self, user: &str, kind: &str, key: &str) -> Result<TrustScore> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT score, approvals, rejections, edits, total_interactions
                 FROM trust_scores WHERE user_id = ?1 AND kind = ?2 AND key = ?3",
                params![user, kind, key],
                |row| {
                    Ok(TrustScore {
                        score: row.get(0)?,
                        approvals: row.get(1)?,
                        rejections: row.get(2)?,
                        edits: row.get(3)?,
                        total_interactions: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_else(TrustScore::zero))
    }

    /// `min(type_trust.score, contact_trust.score, ceiling[reply_type])`.
    pub async fn get_effective_trust(&self, user: &str, contact: &str, reply_type: ReplyType) -> Result<f64> {
        let type_trust = self.get_type_trust(user, reply_type).await?;
        let contact_trust = self.get_contact_trust(user, contact).await?;
        Ok(type_trust.score.min(contact_trust.score).min(reply_type.ceiling()))
    }

    /// `effective ≥ threshold ∧ confidence ≥ threshold`. Monotone
    /// non-decreasing in both `confidence` and the effective trust by
    /// construction (a plain conjunction of two `≥` comparisons).
    pub async fn should_auto_send(
        &self,
        user: &str,
        contact: &str,
        reply_type: ReplyType,
        confidence: f64,
        threshold: f64,
    ) -> Result<bool> {
        let effective = self.get_effective_trust(user, contact, reply_type).await?;
        Ok(effective >= threshold && confidence >= threshold)
    }

    /// Upsert both ledgers for one reviewed outcome. Returns the updated rows.
    pub async fn record_feedback(
        &self,
        user: &str,
        contact: &str,
        reply_type: ReplyType,
        outcome: Outcome,
    ) -> Result<(TrustScore, TrustScore)> {
        let delta = outcome.delta();
        let type_cap = reply_type.ceiling().min(GLOBAL_CAP);

        let db = self.db.lock().await;
        let tx = db.unchecked_transaction()?;
        let new_type = upsert(&tx, user, "type", reply_type.as_str(), delta, outcome, type_cap)?;
        let new_contact = upsert(&tx, user, "contact", contact, delta, outcome, GLOBAL_CAP)?;
        tx.commit()?;
        Ok((new_type, new_contact))
    }
}

fn upsert(
    conn: &Connection,
    user: &str,
    kind: &str,
    key: &str,
    delta: f64,
    outcome: Outcome,
    cap: f64,
) -> Result<TrustScore> {
    let existing = conn
        .query_row(
            "SELECT score, approvals, rejections, edits, total_interactions
             FROM trust_scores WHERE user_id = ?1 AND kind = ?2 AND key = ?3",
            params![user, kind, key],
            |row| {
                Ok(TrustScore {
                    score: row.get(0)?,
                    approvals: row.get(1)?,
                    rejections: row.get(2)?,
                    edits: row.get(3)?,
                    total_interactions: row.get(4)?,
                })
            },
        )
        .optional()?
        .unwrap_or_else(TrustScore::zero);

    let mut updated = existing;
    updated.score = clamp(existing.score + delta, 0.0, cap);
    updated.total_interactions += 1;
    match outcome {
        Outcome::Approved => updated.approvals += 1,
        Outcome::Rejected => updated.rejections += 1,
        Outcome::MinorEdit | Outcome::MajorEdit => updated.edits += 1,
    }

    conn.execute(
        "INSERT INTO trust_scores (user_id, kind, key, score, approvals, rejections, edits, total_interactions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id, kind, key) DO UPDATE SET
            score = excluded.score,
            approvals = excluded.approvals,
            rejections = excluded.rejections,
            edits = excluded.edits,
            total_interactions = excluded.total_interactions",
        params![
            user,
            kind,
            key,
            updated.score,
            updated.approvals,
            updated.rejections,
            updated.edits,
            updated.total_interactions,
        ],
    )?;

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> TrustLedger {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate(&conn).unwrap();
        TrustLedger::new(Arc::new(Mutex::new(conn)))
    }

    #[tokio::test]
    async fn absent_row_is_zero_trust() {
        let ledger = ledger();
        let score = ledger.get_type_trust("u1", ReplyType::General).await.unwrap();
        assert_eq!(score, TrustScore::zero());
    }

    #[tokio::test]
    async fn record_feedback_matches_s2_scenario() {
        let ledger = ledger();
        let outcomes = [
            Outcome::Approved,
            Outcome::Approved,
            Outcome::Approved,
            Outcome::MinorEdit,
            Outcome::Approved,
        ];
        let mut last = TrustScore::zero();
        for outcome in outcomes {
            let (type_trust, _) = ledger
                .record_feedback("1", "a@b", ReplyType::General, outcome)
                .await
                .unwrap();
            last = type_trust;
        }
        assert!((last.score - 0.18).abs() < 1e-9);
    }

    #[tokio::test]
    async fn score_never_exceeds_ceiling() {
        let ledger = ledger();
        for _ in 0..50 {
            ledger
                .record_feedback("u1", "c1", ReplyType::Sensitive, Outcome::Approved)
                .await
                .unwrap();
        }
        let score = ledger.get_type_trust("u1", ReplyType::Sensitive).await.unwrap();
        assert!(score.score <= ReplyType::Sensitive.ceiling());
        assert!(score.score <= 0.95);
    }

    #[tokio::test]
    async fn score_never_goes_below_zero() {
        let ledger = ledger();
        for _ in 0..20 {
            ledger
                .record_feedback("u1", "c1", ReplyType::General, Outcome::Rejected)
                .await
                .unwrap();
        }
        let score = ledger.get_type_trust("u1", ReplyType::General).await.unwrap();
        assert!(score.score >= 0.0);
    }

    #[tokio::test]
    async fn should_auto_send_requires_both_thresholds() {
        let ledger = ledger();
        for _ in 0..20 {
            ledger
                .record_feedback("u1", "c1", ReplyType::Acknowledgment, Outcome::Approved)
                .await
                .unwrap();
        }
        assert!(
            ledger
                .should_auto_send("u1", "c1", ReplyType::Acknowledgment, 0.9, 0.85)
                .await
                .unwrap()
        );
        assert!(
            !ledger
                .should_auto_send("u1", "c1", ReplyType::Acknowledgment, 0.5, 0.85)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_outcome_string_fails() {
        assert!(Outcome::parse("maybe").is_err());
    }

    #[test]
    fn approval_rate_handles_zero_total() {
        assert_eq!(TrustScore::zero().approval_rate(), 0.0);
    }

    #[test]
    fn approval_rate_divides_correctly() {
        let score = TrustScore {
            score: 0.5,
            approvals: 3,
            rejections: 1,
            edits: 0,
            total_interactions: 4,
        };
        assert_eq!(score.approval_rate(), 0.75);
    }
}
