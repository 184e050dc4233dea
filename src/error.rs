use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// API error kinds, mapped onto HuggingFace-shaped responses: an HTTP
/// status, an `X-Error-Code` header, and a JSON `{error, message}` body.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid repository type: {0}")]
    InvalidRepoType(String),

    #[error("invalid repository id: {0}")]
    InvalidRepoId(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("repository already exists: {0}")]
    RepoExists(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRepoType(_)
            | Self::InvalidRepoId(_)
            | Self::RepoExists(_)
            | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RepoNotFound(_) | Self::RevisionNotFound(_) | Self::EntryNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// HuggingFace-compatible error code carried in `X-Error-Code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRepoType(_) => "InvalidRepoType",
            Self::InvalidRepoId(_) => "InvalidRepoId",
            Self::RepoNotFound(_) => "RepoNotFound",
            Self::RevisionNotFound(_) => "RevisionNotFound",
            Self::EntryNotFound(_) => "EntryNotFound",
            Self::RepoExists(_) => "RepoExists",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::BadRequest(_) => "BadRequest",
            Self::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Self::Internal(_) => "ServerError",
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        if let Self::Internal(err) = &self {
            tracing::error!(error = %err, "internal server error");
        }

        let message = match &self {
            // Never leak internals to clients.
            Self::Internal(_) => "internal server error".to_owned(),
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "error": self.code(),
            "message": message,
        });

        let mut response = (self.status(), axum::Json(body)).into_response();
        response.headers_mut().insert(
            "x-error-code",
            HeaderValue::from_static(self.code()),
        );
        response
    }
}

impl From<sqlx::Error> for HubError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::EntryNotFound("resource not found".into()),
            sqlx::Error::Database(db_err) => {
                // 23505 = Postgres unique violation; SQLite reports 1555/2067.
                let unique = db_err.code().as_deref() == Some("23505")
                    || db_err.code().as_deref() == Some("1555")
                    || db_err.code().as_deref() == Some("2067");
                if unique {
                    Self::BadRequest("resource already exists".into())
                } else {
                    tracing::error!(error = %err, "database error");
                    Self::Internal(err.into())
                }
            }
            _ => {
                tracing::error!(error = %err, "database error");
                Self::Internal(err.into())
            }
        }
    }
}

impl From<opendal::Error> for HubError {
    fn from(err: opendal::Error) -> Self {
        tracing::error!(error = %err, "object store error");
        Self::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            HubError::RepoNotFound("a/b".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(HubError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(HubError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            HubError::QuotaExceeded("x".into()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            HubError::RepoExists("a/b".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn code_matches_kind() {
        assert_eq!(HubError::RevisionNotFound("main".into()).code(), "RevisionNotFound");
        assert_eq!(HubError::QuotaExceeded("x".into()).code(), "QuotaExceeded");
    }

    #[test]
    fn internal_message_is_opaque() {
        let err = HubError::Internal(anyhow::anyhow!("secret detail"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("x-error-code").unwrap(),
            "ServerError"
        );
    }
}
