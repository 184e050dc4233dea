//! Repository info, revision info and listing endpoints.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::helpers;
use crate::auth::middleware::OptionalAuthUser;
use crate::auth::permissions;
use crate::db::{self, Repository};
use crate::error::HubError;
use crate::fallback::operations as fallback;
use crate::quota;
use crate::repo::{LfsPolicy, RepoType, lakefs_repo_name};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/{repo_type}", get(list_repos))
        .route("/api/{repo_type}/{namespace}/{name}", get(repo_info))
        .route(
            "/api/{repo_type}/{namespace}/{name}/revision/{revision}",
            get(revision_info),
        )
        .route("/api/users/{username}/repos", get(user_repos))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    author: Option<String>,
    limit: Option<i64>,
    fallback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FallbackQuery {
    fallback: Option<String>,
}

/// Shared body of the info and revision endpoints.
async fn build_repo_info(
    state: &AppState,
    repo_type: RepoType,
    repo: &Repository,
    revision: &str,
    authenticated: bool,
) -> Result<serde_json::Value, HubError> {
    let (sha, last_modified) = helpers::branch_head_info(state, repo, revision).await;
    if sha.is_none() && revision != "main" {
        return Err(HubError::RevisionNotFound(revision.to_owned()));
    }

    // Siblings: every file on the revision, with LFS metadata where the
    // policy or the File row says so.
    let lakefs_repo = lakefs_repo_name(repo_type, &repo.namespace, &repo.name);
    let policy = LfsPolicy::effective(repo, &state.config.app);
    let file_rows: std::collections::HashMap<String, db::FileRow> =
        db::list_files(&state.pool, &repo.id)
            .await?
            .into_iter()
            .map(|row| (row.path_in_repo.clone(), row))
            .collect();

    let mut siblings = Vec::new();
    match state
        .lakefs
        .list_all_objects(&lakefs_repo, revision, "", "")
        .await
    {
        Ok(objects) => {
            for object in objects.iter().filter(|o| o.is_object()) {
                let row = file_rows.get(&object.path);
                let is_lfs = row.map_or_else(
                    || policy.is_lfs(&object.path, object.size_bytes),
                    |row| row.lfs,
                );
                let mut sibling = serde_json::json!({
                    "rfilename": object.path,
                    "size": object.size_bytes,
                });
                if is_lfs {
                    let checksum = row
                        .map(|row| row.sha256.clone())
                        .filter(|c| !c.is_empty())
                        .unwrap_or_else(|| object.checksum.clone());
                    sibling["lfs"] = serde_json::json!({
                        "sha256": checksum,
                        "size": object.size_bytes,
                        "pointerSize": 134,
                    });
                }
                siblings.push(sibling);
            }
        }
        Err(e) if e.is_not_found() => {
            if revision != "main" {
                return Err(helpers::revision_err(&e, revision));
            }
        }
        Err(e) => {
            tracing::warn!(repo = %repo.full_id, error = %e, "sibling listing failed");
        }
    }

    let mut info = serde_json::json!({
        "_id": repo.id,
        "id": repo.full_id,
        "modelId": if repo_type == RepoType::Model {
            serde_json::Value::from(repo.full_id.clone())
        } else {
            serde_json::Value::Null
        },
        "author": repo.namespace,
        "sha": sha,
        "lastModified": last_modified,
        "createdAt": helpers::format_hf_datetime(repo.created_at),
        "private": repo.private,
        "disabled": false,
        "gated": false,
        "downloads": repo.downloads,
        "likes": repo.likes_count,
        "tags": [],
        "pipeline_tag": null,
        "library_name": null,
        "siblings": siblings,
    });

    if authenticated {
        info["storage"] = quota::repo_storage_info(&state.pool, repo).await?;
    }

    Ok(info)
}

#[tracing::instrument(skip(state, user, query), fields(%namespace, %name), err)]
async fn repo_info(
    State(state): State<AppState>,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    Query(query): Query<FallbackQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Response, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;

    let local = async {
        let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
        permissions::check_repo_read(&state.pool, &repo, user.as_ref().map(|u| &u.user)).await?;
        build_repo_info(&state, repo_type, &repo, "main", user.is_some()).await
    }
    .await;

    match local {
        Ok(info) => Ok(Json(info).into_response()),
        Err(HubError::RepoNotFound(id))
            if fallback::enabled_for_request(&state, query.fallback.as_deref()) =>
        {
            match fallback::try_info(&state, repo_type, &namespace, &name).await {
                Some(info) => Ok(Json(info).into_response()),
                None => Err(HubError::RepoNotFound(id)),
            }
        }
        Err(e) => Err(e),
    }
}

#[tracing::instrument(skip(state, user, query), fields(%namespace, %name, %revision), err)]
async fn revision_info(
    State(state): State<AppState>,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    Query(query): Query<FallbackQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Response, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;

    let local = async {
        let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
        permissions::check_repo_read(&state.pool, &repo, user.as_ref().map(|u| &u.user)).await?;
        build_repo_info(&state, repo_type, &repo, &revision, user.is_some()).await
    }
    .await;

    match local {
        Ok(info) => Ok(Json(info).into_response()),
        Err(HubError::RepoNotFound(id))
            if fallback::enabled_for_request(&state, query.fallback.as_deref()) =>
        {
            match fallback::try_info(&state, repo_type, &namespace, &name).await {
                Some(info) => Ok(Json(info).into_response()),
                None => Err(HubError::RepoNotFound(id)),
            }
        }
        Err(e) => Err(e),
    }
}

#[tracing::instrument(skip(state, user, query), err)]
async fn list_repos(
    State(state): State<AppState>,
    Path(repo_type): Path<String>,
    Query(query): Query<ListQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Json<Vec<serde_json::Value>>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let limit = query.limit.map(|l| l.clamp(1, 1000));

    let rows =
        db::list_repositories_by_type(&state.pool, repo_type.as_str(), query.author.as_deref())
            .await?;
    let visible =
        helpers::filter_visible(&state, rows, user.as_ref().map(|u| &u.user)).await?;

    let mut items = Vec::with_capacity(visible.len());
    for repo in &visible {
        items.push(helpers::repo_list_item(&state, repo).await);
    }
    // Newest activity first; repos without a head go last.
    items.sort_by(|a, b| {
        let key = |v: &serde_json::Value| {
            v.get("lastModified")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_owned()
        };
        key(b).cmp(&key(a))
    });
    if let Some(limit) = limit
        && items.len() > limit as usize
    {
        items.truncate(limit as usize);
    }

    // Listing always aggregates sources (local wins on id collisions).
    if fallback::enabled_for_request(&state, query.fallback.as_deref()) {
        items =
            fallback::aggregate_lists(&state, repo_type, query.author.as_deref(), limit, items)
                .await;
    }

    Ok(Json(items))
}

#[tracing::instrument(skip(state, user, query), err)]
async fn user_repos(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<FallbackQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Json<serde_json::Value>, HubError> {
    let user_exists = db::get_user_by_name(&state.pool, &username).await?.is_some();
    let org_exists = db::get_organization_by_name(&state.pool, &username)
        .await?
        .is_some();
    if !user_exists && !org_exists {
        if fallback::enabled_for_request(&state, query.fallback.as_deref())
            && let Some(repos) = fallback::try_user_repos(&state, &username).await
        {
            return Ok(Json(repos));
        }
        return Err(HubError::EntryNotFound(format!(
            "user or organization '{username}' not found"
        )));
    }

    let mut result = serde_json::Map::new();
    for repo_type in [RepoType::Model, RepoType::Dataset, RepoType::Space] {
        let rows =
            db::list_repositories_by_type(&state.pool, repo_type.as_str(), Some(&username)).await?;
        let visible =
            helpers::filter_visible(&state, rows, user.as_ref().map(|u| &u.user)).await?;

        let mut items = Vec::with_capacity(visible.len());
        for repo in &visible {
            items.push(helpers::repo_list_item(&state, repo).await);
        }
        result.insert(repo_type.plural().to_owned(), items.into());
    }

    Ok(Json(result.into()))
}
