//! RBAC users & audit trail (§6, §4.M `UserStore`): a closed four-level
//! role hierarchy, Argon2id password hashing, and an append-only audit
//! ledger for every role mutation.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Closed RBAC role set with a strict hierarchy: `owner(4) > admin(3) >
/// user(2) > restricted(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Restricted,
    User,
    Admin,
    Owner,
}

impl Role {
    pub fn level(self) -> u8 {
        match self {
            Role::Restricted => 1,
            Role::User => 2,
            Role::Admin => 3,
            Role::Owner => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::User => "user",
            Role::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            "restricted" => Ok(Role::Restricted),
            other => Err(AppError::Input(format!("unknown role '{other}'"))),
        }
    }

    /// The floor used by the `admin`-gated routes of §6.1: the caller's own
    /// role must be at least `admin`.
    pub fn at_least_admin(self) -> bool {
        self.level() >= Role::Admin.level()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub action: String,
    pub target: Option<String>,
    pub performed_by: String,
    pub old_role: Option<String>,
    pub new_role: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Fatal(format!("argon2 hash: {e}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let role: String = row.get(3)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::Restricted),
        password_hash: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// SQLite-backed `UserStore` (§4.M): user CRUD plus the RBAC audit ledger.
/// `update_role` and `delete` enforce the hierarchy rule themselves since
/// their signatures carry `performed_by`; `create`'s "role strictly below
/// caller" rule is enforced by the HTTP handler, which is the only layer
/// that has the caller's identity before a user row exists to check against.
pub struct UserStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl UserStore {
    pub fn new(db: Arc<Mutex<rusqlite::Connection>>) -> Self {
        Self { db }
    }

    pub async fn create(&self, username: &str, display_name: &str, password: &str, role: Role) -> Result<User> {
        let id = Uuid::new_v4().to_string();
        let password_hash = hash_password(password)?;

        let db = self.db.lock().await;
        let exists: bool = db.query_row(
            "SELECT COUNT(*) > 0 FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        if exists {
            return Err(AppError::Input(format!("username '{username}' already taken")));
        }

        db.execute(
            "INSERT INTO users (id, username, display_name, role, password_hash) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, username, display_name, role.as_str(), password_hash],
        )?;
        info!(username, role = role.as_str(), "user created");

        db.query_row(
            "SELECT id, username, display_name, role, password_hash, created_at FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .map_err(AppError::Database)
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT id, username, display_name, role, password_hash, created_at FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()
        .map_err(AppError::Database)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT id, username, display_name, role, password_hash, created_at FROM users WHERE username = ?1",
            params![username],
            row_to_user,
        )
        .optional()
        .map_err(AppError::Database)
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, username, display_name, role, password_hash, created_at FROM users ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(AppError::Database)
    }

    /// Authenticate by username/password. Returns `None` on any mismatch —
    /// callers must not distinguish "no such user" from "wrong password".
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_by_username(username).await? else {
            return Ok(None);
        };
        Ok(if verify_password(password, &user.password_hash) {
            Some(user)
        } else {
            None
        })
    }

    /// Change `target_id`'s role. `performed_by` must exist, be at least
    /// `admin`, and `new_role` must be strictly below `performed_by`'s own
    /// role. Owners cannot have their role changed by anyone. Always
    /// appends an audit record, including on refusal.
    pub async fn update_role(
        &self,
        target_id: &str,
        new_role: Role,
        performed_by: &str,
        reason: Option<&str>,
    ) -> Result<User> {
        let actor = self
            .get(performed_by)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("performer '{performed_by}' not found")))?;
        let target = self
            .get(target_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user '{target_id}' not found")))?;

        if !actor.role.at_least_admin() {
            self.record_refusal("update_role", target_id, performed_by, "caller below admin floor").await;
            return Err(AppError::Forbidden("caller role below admin floor".to_string()));
        }
        if target.role == Role::Owner {
            self.record_refusal("update_role", target_id, performed_by, "owners are non-removable").await;
            return Err(AppError::Forbidden("owners cannot have their role changed".to_string()));
        }
        if new_role.level() >= actor.role.level() {
            self.record_refusal("update_role", target_id, performed_by, "new role not strictly below caller's own").await;
            return Err(AppError::Forbidden("new role must be strictly below the caller's own".to_string()));
        }

        let db = self.db.lock().await;
        db.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![new_role.as_str(), target_id],
        )?;
        drop(db);

        self.append_audit(
            "update_role",
            Some(target_id),
            performed_by,
            Some(target.role.as_str()),
            Some(new_role.as_str()),
            reason,
        )
        .await?;

        self.get(target_id).await?.ok_or_else(|| AppError::NotFound(target_id.to_string()))
    }

    /// Delete `target_id`. Refuses to delete an owner. Always appends an
    /// audit record, including on refusal.
    pub async fn delete(&self, target_id: &str, performed_by: &str, reason: Option<&str>) -> Result<()> {
        let actor = self
            .get(performed_by)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("performer '{performed_by}' not found")))?;
        let target = self
            .get(target_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user '{target_id}' not found")))?;

        if !actor.role.at_least_admin() {
            self.record_refusal("delete", target_id, performed_by, "caller below admin floor").await;
            return Err(AppError::Forbidden("caller role below admin floor".to_string()));
        }
        if target.role == Role::Owner {
            self.record_refusal("delete", target_id, performed_by, "owners are non-removable").await;
            return Err(AppError::Forbidden("owners cannot be deleted".to_string()));
        }

        let db = self.db.lock().await;
        db.execute("DELETE FROM users WHERE id = ?1", params![target_id])?;
        drop(db);

        self.append_audit("delete", Some(target_id), performed_by, Some(target.role.as_str()), None, reason)
            .await?;
        Ok(())
    }

    async fn record_refusal(&self, action: &str, target: &str, performed_by: &str, reason: &str) {
        let _ = self.append_audit(action, Some(target), performed_by, None, None, Some(reason)).await;
    }

    pub async fn append_audit(
        &self,
        action: &str,
        target: Option<&str>,
        performed_by: &str,
        old_role: Option<&str>,
        new_role: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO user_audit (action, target, performed_by, old_role, new_role, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![action, target, performed_by, old_role, new_role, reason],
        )?;
        Ok(())
    }

    pub async fn list_audit(&self) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, action, target, performed_by, old_role, new_role, reason, created_at
             FROM user_audit ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                action: row.get(1)?,
                target: row.get(2)?,
                performed_by: row.get(3)?,
                old_role: row.get(4)?,
                new_role: row.get(5)?,
                reason: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(AppError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn store() -> UserStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate(&conn).unwrap();
        UserStore::new(Arc::new(Mutex::new(conn)))
    }

    #[tokio::test]
    async fn role_hierarchy_orders_correctly() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::User);
        assert!(Role::User > Role::Restricted);
    }

    #[tokio::test]
    async fn create_hashes_password_not_stored_in_plaintext() {
        let store = store();
        let user = store.create("alice", "Alice", "hunter2", Role::User).await.unwrap();
        assert_ne!(user.password_hash, "hunter2");
        assert!(user.password_hash.starts_with("$argon2"));
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let store = store();
        store.create("alice", "Alice", "pw", Role::User).await.unwrap();
        let err = store.create("alice", "Alice Two", "pw2", Role::User).await.unwrap_err();
        assert!(err.to_string().contains("already taken"));
    }

    #[tokio::test]
    async fn authenticate_succeeds_with_correct_password() {
        let store = store();
        store.create("alice", "Alice", "hunter2", Role::User).await.unwrap();
        let user = store.authenticate("alice", "hunter2").await.unwrap();
        assert!(user.is_some());
    }

    #[tokio::test]
    async fn authenticate_fails_with_wrong_password() {
        let store = store();
        store.create("alice", "Alice", "hunter2", Role::User).await.unwrap();
        let user = store.authenticate("alice", "wrong").await.unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn s6_owner_can_assign_admin_role() {
        let store = store();
        let owner = store.create("owner", "Owner", "pw", Role::Owner).await.unwrap();
        let target = store.create("bob", "Bob", "pw", Role::User).await.unwrap();
        let updated = store.update_role(&target.id, Role::Admin, &owner.id, None).await.unwrap();
        assert_eq!(updated.role, Role::Admin);
    }

    #[tokio::test]
    async fn s6_user_cannot_assign_admin_role() {
        let store = store();
        let caller = store.create("user1", "User One", "pw", Role::User).await.unwrap();
        let target = store.create("bob", "Bob", "pw", Role::Restricted).await.unwrap();
        let err = store.update_role(&target.id, Role::Admin, &caller.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn refusal_is_still_audited() {
        let store = store();
        let caller = store.create("user1", "User One", "pw", Role::User).await.unwrap();
        let target = store.create("bob", "Bob", "pw", Role::Restricted).await.unwrap();
        let _ = store.update_role(&target.id, Role::Admin, &caller.id, None).await;
        let audit = store.list_audit().await.unwrap();
        assert!(!audit.is_empty());
    }

    #[tokio::test]
    async fn owners_are_non_removable() {
        let store = store();
        let owner = store.create("owner", "Owner", "pw", Role::Owner).await.unwrap();
        let admin = store.create("admin", "Admin", "pw", Role::Admin).await.unwrap();
        let err = store.delete(&owner.id, &admin.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn owner_role_cannot_be_changed_by_anyone() {
        let store = store();
        let owner_a = store.create("owner_a", "Owner A", "pw", Role::Owner).await.unwrap();
        let owner_b = store.create("owner_b", "Owner B", "pw", Role::Owner).await.unwrap();
        let err = store.update_role(&owner_b.id, Role::Admin, &owner_a.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn admin_can_delete_a_restricted_user() {
        let store = store();
        let admin = store.create("admin", "Admin", "pw", Role::Admin).await.unwrap();
        let target = store.create("bob", "Bob", "pw", Role::Restricted).await.unwrap();
        store.delete(&target.id, &admin.id, Some("cleanup")).await.unwrap();
        assert!(store.get(&target.id).await.unwrap().is_none());
    }
}
