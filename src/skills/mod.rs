//! Skill Contract & Registry (components D, E): a polymorphic capability
//! system with lifecycle (init/ready/error), intent-to-skill routing, and a
//! proactive heartbeat fan-out. Modeled directly on a `Tool`/`ToolRegistry`
//! pattern: one trait object per capability, one registry owning the
//! name→skill and intent→skill indices.

pub mod health_analyzer_skill;
pub mod update_watcher_skill;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{error, warn};
use uuid::Uuid;

use crate::permissions::PermissionSet;

/// A caller's inbound request to a skill, routed by `intent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub user_id: String,
    pub intent: String,
    pub message: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl Request {
    pub fn new(user_id: impl Into<String>, intent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            intent: intent.into(),
            message: message.into(),
            context: HashMap::new(),
        }
    }
}

/// A skill's reply to a [`Request`]. Always references the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(request: &Request, message: impl Into<String>) -> Self {
        Self {
            request_id: request.id,
            success: true,
            message: message.into(),
            data: HashMap::new(),
            error: None,
        }
    }

    pub fn ok_with_data(request: &Request, message: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            request_id: request.id,
            success: true,
            message: message.into(),
            data,
            error: None,
        }
    }

    pub fn error(request: &Request, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            request_id: request.id,
            success: false,
            message: error.clone(),
            data: HashMap::new(),
            error: Some(error),
        }
    }
}

/// A proactive action emitted from a skill's heartbeat, consumed by a
/// chat-adapter (out of scope here). `priority` is an ordinal only — higher
/// values sort first; it is never compared across skills for anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAction {
    pub skill_name: String,
    pub action_type: String,
    pub user_id: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    pub priority: i32,
}

/// Lifecycle state of a registered skill. Mutated only by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    Initializing,
    Ready,
    Error,
    Disabled,
}

impl SkillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillStatus::Initializing => "initializing",
            SkillStatus::Ready => "ready",
            SkillStatus::Error => "error",
            SkillStatus::Disabled => "disabled",
        }
    }
}

/// Static descriptor for a skill. Constructed once at skill-construction
/// time and read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub permissions: PermissionSet,
    pub intents: Vec<String>,
}

/// The capability set every skill implements. A skill need only override
/// `metadata`, `initialize`, and `handle` — the remaining methods have
/// no-op defaults (the "default adapter" from the design notes).
#[async_trait]
pub trait Skill: Send + Sync {
    fn metadata(&self) -> &SkillMetadata;

    /// Idempotent setup. The registry interprets `true` as a transition to
    /// `ready` and `false` as a transition to `error`.
    async fn initialize(&self) -> bool;

    /// Handle a request. Only called by the registry while the skill's
    /// status is `ready`.
    async fn handle(&self, request: &Request) -> Response;

    /// Called periodically with the set of known user ids. Default: no actions.
    async fn on_heartbeat(&self, _user_ids: &[String]) -> Vec<HeartbeatAction> {
        Vec::new()
    }

    /// Cheap fragment to enrich an LLM system prompt. Default: none.
    fn get_system_prompt_fragment(&self, _user_id: &str) -> Option<String> {
        None
    }

    /// Best-effort teardown, called once at shutdown. Errors are logged,
    /// never propagated.
    async fn cleanup(&self) {}
}

struct SkillEntry {
    skill: Arc<dyn Skill>,
    status: RwLock<SkillStatus>,
}

/// Bounded concurrency cap for `initialize_all`'s fan-out.
const MAX_CONCURRENT_INIT: usize = 8;

/// Name→skill and intent→skill indices. Maps are mutated only during
/// `register` (startup) and status transitions; readers may observe a
/// stale status for the duration of one dispatch.
pub struct SkillRegistry {
    order: Vec<String>,
    by_name: HashMap<String, SkillEntry>,
    by_intent: HashMap<String, String>,
    heartbeat_timeout: Duration,
}

impl SkillRegistry {
    /// `heartbeat_timeout` is the soft per-skill deadline (§4.D); callers
    /// typically derive it from `scheduler.interval_seconds / skill_count`,
    /// recomputed whenever the registry's population changes.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            order: Vec::new(),
            by_name: HashMap::new(),
            by_intent: HashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Register a skill. Fails if the name is already registered or any of
    /// its intents clash with an already-registered skill. Does not initialize.
    pub fn register(&mut self, skill: Arc<dyn Skill>) -> Result<(), String> {
        let meta = skill.metadata().clone();
        if self.by_name.contains_key(&meta.name) {
            return Err(format!("skill '{}' already registered", meta.name));
        }
        for intent in &meta.intents {
            if let Some(owner) = self.by_intent.get(intent) {
                return Err(format!(
                    "intent '{intent}' already claimed by skill '{owner}'"
                ));
            }
        }

        for intent in &meta.intents {
            self.by_intent.insert(intent.clone(), meta.name.clone());
        }
        self.order.push(meta.name.clone());
        self.by_name.insert(
            meta.name.clone(),
            SkillEntry {
                skill,
                status: RwLock::new(SkillStatus::Initializing),
            },
        );
        Ok(())
    }

    /// Run every skill's initializer concurrently (bounded) and record status.
    pub async fn initialize_all(&self) -> HashMap<String, bool> {
        let sem = Arc::new(Semaphore::new(MAX_CONCURRENT_INIT));
        let mut handles = Vec::with_capacity(self.order.len());

        for name in &self.order {
            let entry = self.by_name.get(name).expect("registered name");
            let skill = entry.skill.clone();
            let sem = sem.clone();
            let name = name.clone();
            handles.push((
                name,
                tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                    skill.initialize().await
                }),
            ));
        }

        let mut results = HashMap::with_capacity(handles.len());
        for (name, handle) in handles {
            let ok = match handle.await {
                Ok(true) => true,
                Ok(false) => false,
                Err(join_err) => {
                    error!(skill = %name, error = %join_err, "skill initializer panicked");
                    false
                }
            };
            let entry = self.by_name.get(&name).expect("registered name");
            *entry.status.write().await = if ok { SkillStatus::Ready } else { SkillStatus::Error };
            results.insert(name, ok);
        }
        results
    }

    /// Resolve `request.intent` and dispatch. Unknown intent returns an
    /// error response without touching any skill.
    pub async fn handle_request(&self, request: &Request) -> Response {
        let Some(name) = self.by_intent.get(&request.intent) else {
            return Response::error(request, "No skill found for intent");
        };
        let entry = self.by_name.get(name).expect("intent index is consistent");

        if *entry.status.read().await != SkillStatus::Ready {
            return Response::error(request, format!("skill '{name}' is not ready"));
        }

        self.safe_handle(name, entry, request).await
    }

    async fn safe_handle(&self, name: &str, entry: &SkillEntry, request: &Request) -> Response {
        let skill = entry.skill.clone();
        let req = request.clone();
        let handle = tokio::spawn(async move { skill.handle(&req).await });

        match handle.await {
            Ok(response) => response,
            Err(join_err) => {
                error!(skill = %name, error = %join_err, "skill handle panicked");
                *entry.status.write().await = SkillStatus::Error;
                Response::error(request, format!("skill '{name}' failed: {join_err}"))
            }
        }
    }

    /// Fan out to every `ready` skill concurrently with a soft per-call
    /// deadline. The returned sequence preserves registration order, not
    /// completion order. A timeout or panic drops that skill's actions and
    /// logs a warning — it never marks the skill `error` and never fails
    /// the whole beat.
    pub async fn run_heartbeat(&self, user_ids: &[String]) -> Vec<HeartbeatAction> {
        let mut handles = Vec::new();
        for name in &self.order {
            let entry = self.by_name.get(name).expect("registered name");
            if *entry.status.read().await != SkillStatus::Ready {
                continue;
            }
            let skill = entry.skill.clone();
            let uids = user_ids.to_vec();
            let budget = self.heartbeat_timeout;
            handles.push((
                name.clone(),
                tokio::spawn(async move { timeout(budget, skill.on_heartbeat(&uids)).await }),
            ));
        }

        let mut actions = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(mut acts)) => actions.append(&mut acts),
                Ok(Err(_elapsed)) => {
                    warn!(skill = %name, "heartbeat exceeded its soft deadline, dropping actions");
                }
                Err(join_err) => {
                    warn!(skill = %name, error = %join_err, "heartbeat panicked, dropping actions");
                }
            }
        }
        actions
    }

    /// Collect non-empty system prompt fragments from every `ready` skill.
    pub async fn get_system_prompt_fragments(&self, user_id: &str) -> Vec<String> {
        let mut fragments = Vec::new();
        for name in &self.order {
            let entry = self.by_name.get(name).expect("registered name");
            if *entry.status.read().await != SkillStatus::Ready {
                continue;
            }
            if let Some(fragment) = entry.skill.get_system_prompt_fragment(user_id) {
                if !fragment.is_empty() {
                    fragments.push(fragment);
                }
            }
        }
        fragments
    }

    pub fn list_intents(&self) -> HashMap<String, String> {
        self.by_intent.clone()
    }

    pub fn list_metadata(&self) -> Vec<SkillMetadata> {
        self.order
            .iter()
            .map(|name| self.by_name[name].skill.metadata().clone())
            .collect()
    }

    pub fn get_metadata(&self, name: &str) -> Option<SkillMetadata> {
        self.by_name.get(name).map(|e| e.skill.metadata().clone())
    }

    pub async fn get_status_summary(&self) -> StatusSummary {
        let mut by_status: HashMap<String, Vec<String>> = HashMap::new();
        let mut ready_count = 0;
        let mut error_count = 0;

        for name in &self.order {
            let entry = &self.by_name[name];
            let status = *entry.status.read().await;
            match status {
                SkillStatus::Ready => ready_count += 1,
                SkillStatus::Error => error_count += 1,
                _ => {}
            }
            by_status.entry(status.as_str().to_string()).or_default().push(name.clone());
        }

        StatusSummary {
            total_skills: self.order.len(),
            ready_count,
            error_count,
            by_status,
            total_intents: self.by_intent.len(),
        }
    }

    /// Admin transition: force a skill to `disabled` regardless of current status.
    pub async fn disable(&self, name: &str) -> Result<(), String> {
        let entry = self.by_name.get(name).ok_or_else(|| format!("unknown skill '{name}'"))?;
        *entry.status.write().await = SkillStatus::Disabled;
        Ok(())
    }

    /// Find the first skill currently in `error` status, used by the
    /// `restart_skill` healing action.
    pub async fn first_errored(&self) -> Option<String> {
        for name in &self.order {
            if *self.by_name[name].status.read().await == SkillStatus::Error {
                return Some(name.clone());
            }
        }
        None
    }

    /// Re-run a single skill's initializer, used by `restart_skill`.
    pub async fn restart(&self, name: &str) -> bool {
        let Some(entry) = self.by_name.get(name) else {
            return false;
        };
        let skill = entry.skill.clone();
        let name_owned = name.to_string();
        let ok = match tokio::spawn(async move { skill.initialize().await }).await {
            Ok(ok) => ok,
            Err(join_err) => {
                error!(skill = %name_owned, error = %join_err, "skill restart panicked");
                false
            }
        };
        *entry.status.write().await = if ok { SkillStatus::Ready } else { SkillStatus::Error };
        ok
    }

    pub async fn status_of(&self, name: &str) -> Option<SkillStatus> {
        match self.by_name.get(name) {
            Some(entry) => Some(*entry.status.read().await),
            None => None,
        }
    }

    pub async fn cleanup_all(&self) {
        for name in &self.order {
            self.by_name[name].skill.cleanup().await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub total_skills: usize,
    pub ready_count: usize,
    pub error_count: usize,
    pub by_status: HashMap<String, Vec<String>>,
    pub total_intents: usize,
}
