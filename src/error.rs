use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

/// Crate-wide error taxonomy. Variants map 1:1 onto the error kinds of the
/// control-plane error handling design: input, authorization, not-found,
/// collaborator-unavailable, skill-runtime, and fatal.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed request: bad JSON, invalid role, unknown namespace. Surfaces as 400.
    #[error("{0}")]
    Input(String),

    /// Missing or mismatched `X-API-Secret`. Surfaces as 401.
    #[error("unauthorized")]
    Unauthorized,

    /// Caller's RBAC role is too low for the requested mutation. Surfaces as 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unknown skill, intent, user, or setting. Surfaces as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// A collaborator (DB, system probe, external HTTP oracle) is absent or failing.
    /// Call sites degrade rather than propagate this to the HTTP boundary, except
    /// where "not configured" is itself the correct 501 response.
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// An exception surfaced from `Skill::handle` or `Skill::on_heartbeat`.
    /// Caught at the registry boundary; never reaches the HTTP layer directly.
    #[error("skill runtime error: {0}")]
    SkillRuntime(String),

    /// Unrecoverable startup failure. The process is expected to exit.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Single place that maps the error taxonomy onto HTTP status codes and the
/// `{error}` JSON envelope (§7.1). No handler body needs its own mapping —
/// returning `Result<Json<T>, AppError>` is enough to satisfy the "no
/// exception crosses the HTTP boundary" rule.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Input(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CollaboratorUnavailable(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::SkillRuntime(_) | AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) | AppError::Database(_) | AppError::Json(_) | AppError::Io(_) | AppError::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error crossing HTTP boundary");
            (status, Json(serde_json::json!({"error": "Internal server error"}))).into_response()
        } else {
            (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let cases: Vec<(AppError, &str)> = vec![
            (AppError::Input("bad role".into()), "bad role"),
            (AppError::Unauthorized, "unauthorized"),
            (AppError::Forbidden("role too low".into()), "forbidden: role too low"),
            (AppError::NotFound("skill".into()), "not found: skill"),
            (
                AppError::CollaboratorUnavailable("db pool".into()),
                "collaborator unavailable: db pool",
            ),
            (AppError::SkillRuntime("panic in handle".into()), "skill runtime error: panic in handle"),
            (AppError::Fatal("cannot open db".into()), "fatal: cannot open db"),
            (AppError::Config("bad key".into()), "config error: bad key"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AppError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad").unwrap_err();
        let err: AppError = json_err.into();
        assert!(err.to_string().starts_with("JSON error:"));
    }

    #[test]
    fn error_from_rusqlite() {
        let err = rusqlite::Connection::open_in_memory()
            .and_then(|c| c.execute("INVALID SQL", []))
            .unwrap_err();
        let wrapped: AppError = err.into();
        assert!(wrapped.to_string().contains("database error"));
    }

    #[test]
    fn result_type_alias_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.unwrap(), 42);
        let err: Result<i32> = Err(AppError::Fatal("boom".into()));
        assert!(err.is_err());
    }
}
