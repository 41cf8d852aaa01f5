//! Settings Store (component M, §6): key-value configuration scoped to a
//! closed set of namespaces, each value tagged with a `data_type` coerced
//! on read. Replaces the source tree's global-singleton config pattern
//! with a capability passed explicitly to whatever needs it (§9 design
//! notes: "global singleton settings").

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{AppError, Result};

/// Closed set of settings namespaces. Unknown namespaces are rejected on write.
pub const NAMESPACES: &[&str] = &["models", "budgets", "tuning", "scheduler"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
    Json,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(DataType::String),
            "int" => Ok(DataType::Int),
            "float" => Ok(DataType::Float),
            "bool" => Ok(DataType::Bool),
            "json" => Ok(DataType::Json),
            other => Err(AppError::Input(format!("unknown data_type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub namespace: String,
    pub key: String,
    /// The raw stored string. `coerced()` applies `data_type`.
    pub value: String,
    pub data_type: DataType,
}

impl Setting {
    /// Coerce the stored string per `data_type`. An invalid coercion falls
    /// back to the raw string wrapped as a JSON string value, per §6.
    pub fn coerced(&self) -> Value {
        match self.data_type {
            DataType::String => Value::String(self.value.clone()),
            DataType::Int => self
                .value
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(self.value.clone())),
            DataType::Float => self
                .value
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(self.value.clone())),
            DataType::Bool => self
                .value
                .parse::<bool>()
                .map(Value::Bool)
                .unwrap_or_else(|_| Value::String(self.value.clone())),
            DataType::Json => serde_json::from_str(&self.value).unwrap_or_else(|_| Value::String(self.value.clone())),
        }
    }
}

fn check_namespace(namespace: &str) -> Result<()> {
    if NAMESPACES.contains(&namespace) {
        Ok(())
    } else {
        Err(AppError::Input(format!("unknown settings namespace '{namespace}'")))
    }
}

/// SQLite-backed `SettingsStore` (§4.M).
pub struct SettingsStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl SettingsStore {
    pub fn new(db: Arc<Mutex<rusqlite::Connection>>) -> Self {
        Self { db }
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Setting>> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                "SELECT value, data_type FROM settings WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| {
                    let value: String = row.get(0)?;
                    let data_type: String = row.get(1)?;
                    Ok((value, data_type))
                },
            )
            .optional()?;

        match row {
            Some((value, data_type)) => Ok(Some(Setting {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value,
                data_type: DataType::parse(&data_type)?,
            })),
            None => Ok(None),
        }
    }

    /// Convenience accessor used by internal collaborators (e.g. the
    /// scheduler interval read by `adjust_rate_limits`): coerces to an
    /// integer, falling back to `default` if absent or uncoercible.
    pub async fn get_int(&self, namespace: &str, key: &str, default: i64) -> i64 {
        match self.get(namespace, key).await {
            Ok(Some(setting)) => setting.coerced().as_i64().unwrap_or(default),
            Ok(None) => default,
            Err(err) => {
                warn!(error = %err, namespace, key, "settings read failed, using default");
                default
            }
        }
    }

    pub async fn set(&self, namespace: &str, key: &str, value: &str, data_type: DataType) -> Result<()> {
        check_namespace(namespace)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO settings (namespace, key, value, data_type)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                data_type = excluded.data_type",
            params![namespace, key, value, data_type.as_str()],
        )?;
        Ok(())
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM settings WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<Setting>> {
        check_namespace(namespace)?;
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT key, value, data_type FROM settings WHERE namespace = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map(params![namespace], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                let data_type: String = row.get(2)?;
                Ok((key, value, data_type))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, value, data_type)| {
                Ok(Setting {
                    namespace: namespace.to_string(),
                    key,
                    value,
                    data_type: DataType::parse(&data_type)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn store() -> SettingsStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrate(&conn).unwrap();
        SettingsStore::new(Arc::new(Mutex::new(conn)))
    }

    #[tokio::test]
    async fn unknown_namespace_rejected_on_write() {
        let store = store();
        let err = store.set("bogus", "k", "v", DataType::String).await.unwrap_err();
        assert!(err.to_string().contains("unknown settings namespace"));
    }

    #[tokio::test]
    async fn roundtrip_int_coercion() {
        let store = store();
        store.set("scheduler", "interval_seconds", "300", DataType::Int).await.unwrap();
        let setting = store.get("scheduler", "interval_seconds").await.unwrap().unwrap();
        assert_eq!(setting.coerced(), Value::from(300));
    }

    #[tokio::test]
    async fn invalid_coercion_falls_back_to_raw_string() {
        let store = store();
        store.set("tuning", "weight", "not-a-number", DataType::Float).await.unwrap();
        let setting = store.get("tuning", "weight").await.unwrap().unwrap();
        assert_eq!(setting.coerced(), Value::String("not-a-number".to_string()));
    }

    #[tokio::test]
    async fn bool_coercion_roundtrips() {
        let store = store();
        store.set("tuning", "enabled", "true", DataType::Bool).await.unwrap();
        let setting = store.get("tuning", "enabled").await.unwrap().unwrap();
        assert_eq!(setting.coerced(), Value::Bool(true));
    }

    #[tokio::test]
    async fn json_coercion_parses_nested_value() {
        let store = store();
        store
            .set("budgets", "caps", r#"{"daily": 10.5}"#, DataType::Json)
            .await
            .unwrap();
        let setting = store.get("budgets", "caps").await.unwrap().unwrap();
        assert_eq!(setting.coerced(), serde_json::json!({"daily": 10.5}));
    }

    #[tokio::test]
    async fn list_returns_all_keys_in_namespace() {
        let store = store();
        store.set("models", "a", "1", DataType::Int).await.unwrap();
        store.set("models", "b", "2", DataType::Int).await.unwrap();
        let settings = store.list("models").await.unwrap();
        assert_eq!(settings.len(), 2);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = store();
        assert!(store.get("scheduler", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let store = store();
        store.set("scheduler", "k", "v", DataType::String).await.unwrap();
        store.delete("scheduler", "k").await.unwrap();
        assert!(store.get("scheduler", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_int_falls_back_to_default_when_absent() {
        let store = store();
        assert_eq!(store.get_int("scheduler", "missing", 300).await, 300);
    }
}
