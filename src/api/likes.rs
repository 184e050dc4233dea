//! Repository likes.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::helpers;
use crate::auth::middleware::{AuthUser, OptionalAuthUser};
use crate::auth::permissions;
use crate::db;
use crate::error::HubError;
use crate::repo::RepoType;
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/{repo_type}/{namespace}/{name}/like",
            get(liked).post(like).delete(unlike),
        )
        .route("/api/{repo_type}/{namespace}/{name}/likers", get(likers))
}

#[derive(Debug, Deserialize)]
struct LikersQuery {
    limit: Option<i64>,
}

async fn has_like(
    state: &AppState,
    repository_id: &str,
    user_id: &str,
) -> Result<bool, HubError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM repositorylike WHERE repository_id = $1 AND user_id = $2",
    )
    .bind(repository_id)
    .bind(user_id)
    .fetch_one(&state.pool)
    .await?;
    Ok(count > 0)
}

#[tracing::instrument(skip(state, auth), fields(%namespace, %name), err)]
async fn like(
    State(state): State<AppState>,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
    permissions::check_repo_read(&state.pool, &repo, Some(&auth.user)).await?;

    if has_like(&state, &repo.id, &auth.user.id).await? {
        return Err(HubError::BadRequest("repository already liked".into()));
    }

    // Like row and counter move together.
    let mut tx = state.pool.begin().await?;
    sqlx::query(
        "INSERT INTO repositorylike (id, repository_id, user_id, created_at)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(db::new_id())
    .bind(&repo.id)
    .bind(&auth.user.id)
    .bind(db::now_unix())
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE repository SET likes_count = likes_count + 1 WHERE id = $1")
        .bind(&repo.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Repository liked successfully",
        "likes_count": repo.likes_count + 1,
    })))
}

#[tracing::instrument(skip(state, auth), fields(%namespace, %name), err)]
async fn unlike(
    State(state): State<AppState>,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;

    let mut tx = state.pool.begin().await?;
    let deleted = sqlx::query(
        "DELETE FROM repositorylike WHERE repository_id = $1 AND user_id = $2",
    )
    .bind(&repo.id)
    .bind(&auth.user.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if deleted == 0 {
        return Err(HubError::BadRequest("repository not liked".into()));
    }

    sqlx::query(
        "UPDATE repository SET likes_count = CASE
           WHEN likes_count > 0 THEN likes_count - 1 ELSE 0 END
         WHERE id = $1",
    )
    .bind(&repo.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Repository unliked successfully",
        "likes_count": (repo.likes_count - 1).max(0),
    })))
}

async fn liked(
    State(state): State<AppState>,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
    permissions::check_repo_read(&state.pool, &repo, user.as_ref().map(|u| &u.user)).await?;

    let liked = match &user {
        Some(auth) => has_like(&state, &repo.id, &auth.user.id).await?,
        None => false,
    };
    Ok(Json(serde_json::json!({ "liked": liked })))
}

async fn likers(
    State(state): State<AppState>,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    Query(query): Query<LikersQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
    permissions::check_repo_read(&state.pool, &repo, user.as_ref().map(|u| &u.user)).await?;

    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let names = sqlx::query_scalar::<_, String>(
        r#"SELECT u.name FROM repositorylike l
           JOIN "user" u ON u.id = l.user_id
           WHERE l.repository_id = $1
           ORDER BY l.created_at DESC
           LIMIT $2"#,
    )
    .bind(&repo.id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    let likers: Vec<serde_json::Value> = names
        .into_iter()
        .map(|username| serde_json::json!({ "username": username }))
        .collect();

    Ok(Json(serde_json::json!({
        "likers": likers,
        "total": repo.likes_count,
    })))
}
