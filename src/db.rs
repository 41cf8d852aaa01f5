use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Open (creating if absent) the SQLite-backed store for every persistence
/// contract in §4.M and run migrations.
pub fn open(path: &Path) -> Result<Connection> {
    info!("opening database at {}", path.display());
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(conn)
}

/// Run database migrations. Exposed so tests can run them against an
/// in-memory connection.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Trust Ledger (component B): one row per (user, kind, key).
        -- kind is 'type' (reply-type ledger) or 'contact' (per-contact ledger).
        CREATE TABLE IF NOT EXISTS trust_scores (
            user_id             TEXT NOT NULL,
            kind                TEXT NOT NULL,
            key                 TEXT NOT NULL,
            score               REAL NOT NULL DEFAULT 0,
            approvals           INTEGER NOT NULL DEFAULT 0,
            rejections          INTEGER NOT NULL DEFAULT 0,
            edits               INTEGER NOT NULL DEFAULT 0,
            total_interactions  INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, kind, key)
        );

        -- Action Controller policies (component C), keyed by (user, domain, action).
        CREATE TABLE IF NOT EXISTS policies (
            user_id      TEXT NOT NULL,
            domain       TEXT NOT NULL,
            action       TEXT NOT NULL,
            mode         TEXT NOT NULL,
            trust_score  REAL NOT NULL DEFAULT 0,
            conditions   TEXT,
            PRIMARY KEY (user_id, domain, action)
        );

        -- Settings (§6): closed namespace set, coerced by data_type on read.
        CREATE TABLE IF NOT EXISTS settings (
            namespace  TEXT NOT NULL,
            key        TEXT NOT NULL,
            value      TEXT NOT NULL,
            data_type  TEXT NOT NULL,
            PRIMARY KEY (namespace, key)
        );

        -- Users & RBAC (§6).
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            display_name  TEXT NOT NULL,
            role          TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS user_audit (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            action        TEXT NOT NULL,
            target        TEXT,
            performed_by  TEXT NOT NULL,
            old_role      TEXT,
            new_role      TEXT,
            reason        TEXT,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Health Monitor persisted state (§6 persisted-state layout).
        CREATE TABLE IF NOT EXISTS snapshots (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            collected_at   TEXT NOT NULL,
            metrics_json   TEXT NOT NULL,
            anomalies_json TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_collected_at ON snapshots(collected_at);

        CREATE TABLE IF NOT EXISTS daily_reports (
            date          TEXT PRIMARY KEY,
            score         REAL NOT NULL,
            deductions    TEXT NOT NULL,
            generated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS healing_actions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action_type TEXT NOT NULL,
            trigger     TEXT NOT NULL,
            result      TEXT NOT NULL,
            details     TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_healing_actions_type_time ON healing_actions(action_type, created_at);

        CREATE TABLE IF NOT EXISTS incidents (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            metric_path TEXT NOT NULL,
            severity    TEXT NOT NULL,
            started_at  TEXT NOT NULL,
            ended_at    TEXT,
            resolution  TEXT
        );

        CREATE TABLE IF NOT EXISTS update_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            version     TEXT NOT NULL,
            outcome     TEXT NOT NULL,
            details     TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn migrate_creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        for expected in [
            "trust_scores",
            "policies",
            "settings",
            "users",
            "user_audit",
            "snapshots",
            "daily_reports",
            "healing_actions",
            "incidents",
            "update_history",
        ] {
            assert!(names.contains(&expected.to_string()), "missing table {expected}");
        }
    }
}
