//! Skills HTTP Server (component L): the boundary. Carries no business
//! logic — every handler forwards to the registry or a store and
//! serializes the result (§4.L).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request as HttpRequest, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, Result};
use crate::settings::{DataType, SettingsStore};
use crate::skills::{HeartbeatAction, Request as SkillRequest, Response as SkillResponse, SkillRegistry};
use crate::users::{Role, User, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SkillRegistry>,
    pub users: Arc<UserStore>,
    pub settings: Arc<SettingsStore>,
    pub api_secret: Option<String>,
}

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/handle", post(handle_request))
        .route("/heartbeat", post(heartbeat))
        .route("/skills", get(list_skills))
        .route("/skills/{name}", get(get_skill))
        .route("/status", get(status_summary))
        .route("/prompt-fragments", get(prompt_fragments))
        .route("/intents", get(list_intents))
        .route("/users", get(list_users).post(create_user))
        .route("/users/audit", get(list_audit))
        .route("/users/{id}", get(get_user).delete(delete_user))
        .route("/users/{id}/role", patch(update_user_role))
        .route("/settings/{namespace}", get(list_settings))
        .route(
            "/settings/{namespace}/{key}",
            get(get_setting).put(set_setting).delete(delete_setting),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .with_state(state)
}

/// `/health` always bypasses this; every other route requires the
/// configured `X-API-Secret` header when one is configured.
async fn require_secret(State(state): State<AppState>, req: HttpRequest<Body>, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let Some(expected) = &state.api_secret else {
        return next.run(req).await;
    };

    let provided = req.headers().get("X-API-Secret").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(req).await
    } else {
        AppError::Unauthorized.into_response()
    }
}

/// Resolve the `X-User-Id` header to a user and enforce the "admin" RBAC
/// floor used by every `/users*` and `/settings*` route (§6.1). `action`
/// labels the attempted route for the audit trail (§7: "Audit the attempt").
async fn require_admin(state: &AppState, headers: &HeaderMap, action: &str) -> Result<User> {
    let user_id = headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    let user = state
        .users
        .get(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user '{user_id}' not found")))?;
    if !user.role.at_least_admin() {
        let _ = state
            .users
            .append_audit(action, None, user_id, None, None, Some("caller role below admin floor"))
            .await;
        return Err(AppError::Forbidden("caller role below admin floor".to_string()));
    }
    Ok(user)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state.registry.get_status_summary().await;
    Json(json!({
        "status": "healthy",
        "skills_ready": summary.ready_count,
        "skills_total": summary.total_skills,
    }))
}

async fn handle_request(State(state): State<AppState>, Json(request): Json<SkillRequest>) -> Json<SkillResponse> {
    Json(state.registry.handle_request(&request).await)
}

#[derive(Deserialize)]
struct HeartbeatBody {
    user_ids: Vec<String>,
}

#[derive(Serialize)]
struct HeartbeatResponseBody {
    actions: Vec<HeartbeatAction>,
}

async fn heartbeat(State(state): State<AppState>, Json(body): Json<HeartbeatBody>) -> Json<HeartbeatResponseBody> {
    let actions = state.registry.run_heartbeat(&body.user_ids).await;
    Json(HeartbeatResponseBody { actions })
}

async fn list_skills(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "skills": state.registry.list_metadata() }))
}

async fn get_skill(State(state): State<AppState>, Path(name): Path<String>) -> std::result::Result<Json<serde_json::Value>, AppError> {
    state
        .registry
        .get_metadata(&name)
        .map(|meta| Json(serde_json::to_value(meta).unwrap_or(serde_json::Value::Null)))
        .ok_or_else(|| AppError::NotFound(format!("skill '{name}'")))
}

async fn status_summary(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state.registry.get_status_summary().await;
    Json(serde_json::to_value(summary).unwrap_or(serde_json::Value::Null))
}

#[derive(Deserialize)]
struct PromptFragmentsQuery {
    user_id: String,
}

async fn prompt_fragments(
    State(state): State<AppState>,
    Query(query): Query<PromptFragmentsQuery>,
) -> Json<serde_json::Value> {
    let fragments = state.registry.get_system_prompt_fragments(&query.user_id).await;
    Json(json!({ "fragments": fragments }))
}

async fn list_intents(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "intents": state.registry.list_intents() }))
}

// -- Users (§6.1) ----------------------------------------------------------

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers, "list_users").await?;
    let users = state.users.list().await?;
    Ok(Json(json!({ "users": users })))
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> std::result::Result<Json<User>, AppError> {
    require_admin(&state, &headers, "get_user").await?;
    state.users.get(&id).await?.map(Json).ok_or_else(|| AppError::NotFound(format!("user '{id}'")))
}

#[derive(Deserialize)]
struct CreateUserBody {
    username: String,
    display_name: String,
    password: String,
    role: String,
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let caller = require_admin(&state, &headers, "create_user").await?;
    let role = Role::parse(&body.role)?;
    if role.level() >= caller.role.level() {
        let _ = state
            .users
            .append_audit(
                "create_user",
                None,
                &caller.id,
                None,
                Some(role.as_str()),
                Some("new user's role not strictly below caller's own"),
            )
            .await;
        return Err(AppError::Forbidden("new user's role must be strictly below the caller's own".to_string()));
    }
    let user = state.users.create(&body.username, &body.display_name, &body.password, role).await?;
    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

#[derive(Deserialize)]
struct UpdateRoleBody {
    role: String,
    reason: Option<String>,
}

async fn update_user_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateRoleBody>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let caller = require_admin(&state, &headers, "update_role").await?;
    let role = Role::parse(&body.role)?;
    let user = state.users.update_role(&id, role, &caller.id, body.reason.as_deref()).await?;
    Ok(Json(json!({ "ok": true, "user": user })))
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let caller = require_admin(&state, &headers, "delete").await?;
    state.users.delete(&id, &caller.id, None).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers, "list_audit").await?;
    let records = state.users.list_audit().await?;
    Ok(Json(json!({ "records": records })))
}

// -- Settings (§6.1) --------------------------------------------------------

async fn list_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(namespace): Path<String>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers, "list_settings").await?;
    let settings = state.settings.list(&namespace).await?;
    Ok(Json(json!({ "settings": settings })))
}

async fn get_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((namespace, key)): Path<(String, String)>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers, "get_setting").await?;
    let setting = state
        .settings
        .get(&namespace, &key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("setting '{namespace}.{key}'")))?;
    Ok(Json(json!({
        "setting": {
            "namespace": setting.namespace,
            "key": setting.key,
            "value": setting.coerced(),
            "data_type": setting.data_type,
        }
    })))
}

#[derive(Deserialize)]
struct SetSettingBody {
    value: String,
    data_type: String,
}

async fn set_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((namespace, key)): Path<(String, String)>,
    Json(body): Json<SetSettingBody>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers, "set_setting").await?;
    let data_type = DataType::parse(&body.data_type)?;
    state.settings.set(&namespace, &key, &body.value, data_type).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((namespace, key)): Path<(String, String)>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    require_admin(&state, &headers, "delete_setting").await?;
    state.settings.delete(&namespace, &key).await?;
    Ok(Json(json!({ "ok": true })))
}
