//! Repository CRUD: create, delete, move.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::auth::permissions;
use crate::db;
use crate::error::HubError;
use crate::quota;
use crate::repo::{RepoType, lakefs_repo_name, split_repo_id};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/repos/create", post(create_repo))
        .route("/api/repos/delete", axum::routing::delete(delete_repo))
        .route("/api/repos/move", post(move_repo))
}

#[derive(Debug, Deserialize)]
struct CreateRepoPayload {
    #[serde(rename = "type", default = "default_type")]
    repo_type: String,
    name: String,
    organization: Option<String>,
    #[serde(default)]
    private: bool,
    // Accepted for spaces, otherwise ignored.
    #[allow(dead_code)]
    sdk: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRepoPayload {
    #[serde(rename = "type", default = "default_type")]
    repo_type: String,
    name: String,
    organization: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MoveRepoPayload {
    #[serde(rename = "fromRepo")]
    from_repo: String,
    #[serde(rename = "toRepo")]
    to_repo: String,
    #[serde(rename = "type", default = "default_type")]
    repo_type: String,
}

fn default_type() -> String {
    "model".to_owned()
}

fn validate_repo_name(name: &str) -> Result<(), HubError> {
    let ok = !name.is_empty()
        && name.len() <= 96
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(HubError::InvalidRepoId(name.to_owned()))
    }
}

#[tracing::instrument(skip(state, auth, payload), fields(name = %payload.name), err)]
async fn create_repo(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CreateRepoPayload>,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse(&payload.repo_type)?;
    validate_repo_name(&payload.name)?;

    let namespace = payload
        .organization
        .clone()
        .unwrap_or_else(|| auth.user.name.clone());
    permissions::check_namespace_use(&state.pool, &namespace, &auth.user).await?;

    let full_id = format!("{namespace}/{}", payload.name);
    if db::get_repository(&state.pool, repo_type.as_str(), &namespace, &payload.name)
        .await?
        .is_some()
    {
        return Err(HubError::RepoExists(full_id));
    }

    // Versioned-store repo first: a failed store create leaves no DB row.
    let lakefs_repo = lakefs_repo_name(repo_type, &namespace, &payload.name);
    let storage_namespace = format!("s3://{}/{lakefs_repo}", state.s3.bucket);
    state
        .lakefs
        .create_repo(&lakefs_repo, &storage_namespace, "main")
        .await
        .map_err(|e| HubError::UpstreamUnavailable(format!("store repo creation failed: {e}")))?;

    sqlx::query(
        "INSERT INTO repository
         (id, repo_type, namespace, name, full_id, private, owner_id, quota_bytes, used_bytes,
          lfs_threshold_bytes, lfs_keep_versions, lfs_suffix_rules, downloads, likes_count,
          created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(db::new_id())
    .bind(repo_type.as_str())
    .bind(&namespace)
    .bind(&payload.name)
    .bind(&full_id)
    .bind(payload.private)
    .bind(&auth.user.id)
    .bind(None::<i64>)
    .bind(0i64)
    .bind(None::<i64>)
    .bind(None::<i64>)
    .bind(None::<String>)
    .bind(0i64)
    .bind(0i64)
    .bind(db::now_unix())
    .execute(&state.pool)
    .await?;

    tracing::info!(repo = %full_id, repo_type = repo_type.as_str(), "repository created");

    Ok(Json(serde_json::json!({
        "url": format!("{}/{}/{full_id}", state.config.app.base_url, repo_type.plural()),
        "repo_id": full_id,
    })))
}

#[tracing::instrument(skip(state, auth, payload), fields(name = %payload.name), err)]
async fn delete_repo(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<DeleteRepoPayload>,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse(&payload.repo_type)?;
    let namespace = payload
        .organization
        .clone()
        .unwrap_or_else(|| auth.user.name.clone());
    let full_id = format!("{namespace}/{}", payload.name);

    let repo = db::get_repository(&state.pool, repo_type.as_str(), &namespace, &payload.name)
        .await?
        .ok_or_else(|| HubError::RepoNotFound(full_id.clone()))?;

    permissions::check_repo_delete(&state.pool, &repo, &auth.user).await?;

    // Store repo first; 404 means it is already gone, which is fine.
    let lakefs_repo = lakefs_repo_name(repo_type, &namespace, &payload.name);
    match state.lakefs.delete_repo(&lakefs_repo, true).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::info!(repo = %full_id, "store repo already gone");
        }
        Err(e) => {
            return Err(HubError::UpstreamUnavailable(format!(
                "store repo deletion failed: {e}"
            )));
        }
    }

    // DB rows in one transaction (cascade done explicitly so both
    // backends behave identically).
    let mut tx = state.pool.begin().await?;
    for table in [
        "lfsobjecthistory",
        "file",
        "stagingupload",
        "repositorylike",
        "downloadsession",
        "dailyrepostats",
    ] {
        let sql = format!("DELETE FROM {table} WHERE repository_id = $1");
        sqlx::query(&sql).bind(&repo.id).execute(&mut *tx).await?;
    }
    sqlx::query(r#"DELETE FROM "commit" WHERE repository_id = $1"#)
        .bind(&repo.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM repository WHERE id = $1")
        .bind(&repo.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    quota::increment_storage(&state.pool, &namespace, -repo.used_bytes, repo.private).await?;

    // Physical cleanup is best-effort and off the request path.
    let s3 = state.s3.clone();
    tokio::spawn(async move {
        if let Err(e) = s3.delete_objects_with_prefix(&format!("{lakefs_repo}/")).await {
            tracing::warn!(error = %e, "storage prefix cleanup failed");
        }
    });

    Ok(Json(serde_json::json!({
        "message": format!("Repository '{full_id}' of type '{}' deleted.", repo_type.as_str()),
    })))
}

#[tracing::instrument(skip(state, auth, payload), err)]
async fn move_repo(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<MoveRepoPayload>,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse(&payload.repo_type)?;
    let (from_ns, from_name) = split_repo_id(&payload.from_repo)?;
    let (to_ns, to_name) = split_repo_id(&payload.to_repo)?;
    validate_repo_name(to_name)?;

    let repo = db::get_repository(&state.pool, repo_type.as_str(), from_ns, from_name)
        .await?
        .ok_or_else(|| HubError::RepoNotFound(payload.from_repo.clone()))?;

    permissions::check_repo_delete(&state.pool, &repo, &auth.user).await?;

    if db::get_repository(&state.pool, repo_type.as_str(), to_ns, to_name)
        .await?
        .is_some()
    {
        return Err(HubError::RepoExists(payload.to_repo.clone()));
    }
    permissions::check_namespace_use(&state.pool, to_ns, &auth.user).await?;

    sqlx::query(
        "UPDATE repository SET namespace = $1, name = $2, full_id = $3 WHERE id = $4",
    )
    .bind(to_ns)
    .bind(to_name)
    .bind(&payload.to_repo)
    .bind(&repo.id)
    .execute(&state.pool)
    .await?;

    // Usage follows the repo across namespaces.
    if from_ns != to_ns {
        quota::increment_storage(&state.pool, from_ns, -repo.used_bytes, repo.private).await?;
        quota::increment_storage(&state.pool, to_ns, repo.used_bytes, repo.private).await?;
    }

    // The store repo keeps its old name; copy the storage prefix so the
    // new name resolves, best-effort.
    let old_store = lakefs_repo_name(repo_type, from_ns, from_name);
    let new_store = lakefs_repo_name(repo_type, to_ns, to_name);
    let s3 = state.s3.clone();
    tokio::spawn(async move {
        match s3
            .copy_s3_folder(&format!("{old_store}/"), &format!("{new_store}/"), Some("_lakefs/"))
            .await
        {
            Ok(copied) => tracing::info!(copied, "storage prefix copied for move"),
            Err(e) => tracing::warn!(error = %e, "storage prefix copy failed"),
        }
    });

    tracing::info!(from = %payload.from_repo, to = %payload.to_repo, "repository moved");

    Ok(Json(serde_json::json!({
        "success": true,
        "url": format!("{}/{}/{}", state.config.app.base_url, repo_type.plural(), payload.to_repo),
        "message": format!("Repository moved from {} to {}", payload.from_repo, payload.to_repo),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_validation() {
        assert!(validate_repo_name("bert-base").is_ok());
        assert!(validate_repo_name("v1.0_final").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("a/b").is_err());
        assert!(validate_repo_name("name with spaces").is_err());
    }

    #[test]
    fn payload_defaults() {
        let payload: CreateRepoPayload =
            serde_json::from_value(serde_json::json!({"name": "m"})).unwrap();
        assert_eq!(payload.repo_type, "model");
        assert!(!payload.private);
        assert!(payload.organization.is_none());
    }
}
