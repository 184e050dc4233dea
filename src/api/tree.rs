//! Tree listing and per-path metadata endpoints.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::helpers;
use crate::auth::middleware::OptionalAuthUser;
use crate::auth::permissions;
use crate::db::{self, Repository};
use crate::error::HubError;
use crate::fallback::operations as fallback;
use crate::lakefs::ObjectStats;
use crate::repo::{LfsPolicy, RepoType, lakefs_repo_name};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/{repo_type}/{namespace}/{name}/tree/{revision}", get(tree_root))
        .route(
            "/api/{repo_type}/{namespace}/{name}/tree/{revision}/{*path}",
            get(tree_subdir),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/paths-info/{revision}",
            post(paths_info),
        )
}

#[derive(Debug, Deserialize)]
struct TreeQuery {
    #[serde(default)]
    recursive: bool,
    fallback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PathsInfoQuery {
    fallback: Option<String>,
}

async fn tree_root(
    state: State<AppState>,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    query: Query<TreeQuery>,
    user: OptionalAuthUser,
) -> Result<Response, HubError> {
    tree_impl(state, repo_type, namespace, name, revision, String::new(), query, user).await
}

async fn tree_subdir(
    state: State<AppState>,
    Path((repo_type, namespace, name, revision, path)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    query: Query<TreeQuery>,
    user: OptionalAuthUser,
) -> Result<Response, HubError> {
    tree_impl(state, repo_type, namespace, name, revision, path, query, user).await
}

/// One tree entry in HF shape. `oid` is the git-blob SHA-1 for regular
/// files and the SHA-256 for LFS files, taken from the `File` row when
/// available.
fn file_entry(
    object: &ObjectStats,
    relative_path: &str,
    row: Option<&db::FileRow>,
    policy: &LfsPolicy,
) -> serde_json::Value {
    let is_lfs = row.map_or_else(
        || policy.is_lfs(&object.path, object.size_bytes),
        |row| row.lfs,
    );
    let checksum = row
        .map(|row| row.sha256.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| object.checksum.clone());

    let mut entry = serde_json::json!({
        "type": "file",
        "oid": checksum,
        "size": object.size_bytes,
        "path": relative_path,
    });
    if object.mtime > 0 {
        entry["lastModified"] = helpers::format_hf_datetime(object.mtime).into();
    }
    if is_lfs {
        entry["lfs"] = serde_json::json!({
            "oid": checksum,
            "size": object.size_bytes,
            "pointerSize": 134,
        });
    }
    entry
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(%namespace, %name, %revision, %path), err)]
async fn tree_impl(
    State(state): State<AppState>,
    repo_type: String,
    namespace: String,
    name: String,
    revision: String,
    path: String,
    Query(query): Query<TreeQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
) -> Result<Response, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;

    let repo = match helpers::get_repo(&state, repo_type, &namespace, &name).await {
        Ok(repo) => repo,
        Err(HubError::RepoNotFound(id))
            if fallback::enabled_for_request(&state, query.fallback.as_deref()) =>
        {
            return match fallback::try_tree(&state, repo_type, &namespace, &name, &revision, &path)
                .await
            {
                Some(tree) => Ok(Json(tree).into_response()),
                None => Err(HubError::RepoNotFound(id)),
            };
        }
        Err(e) => return Err(e),
    };
    permissions::check_repo_read(&state.pool, &repo, user.as_ref().map(|u| &u.user)).await?;

    let entries =
        list_tree(&state, repo_type, &repo, &revision, &path, query.recursive).await?;
    Ok(Json(entries).into_response())
}

async fn list_tree(
    state: &AppState,
    repo_type: RepoType,
    repo: &Repository,
    revision: &str,
    path: &str,
    recursive: bool,
) -> Result<Vec<serde_json::Value>, HubError> {
    let lakefs_repo = lakefs_repo_name(repo_type, &repo.namespace, &repo.name);

    let mut prefix = path.trim_start_matches('/').to_owned();
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }

    let delimiter = if recursive { "" } else { "/" };
    let objects = match state
        .lakefs
        .list_all_objects(&lakefs_repo, revision, &prefix, delimiter)
        .await
    {
        Ok(objects) => objects,
        Err(e) if e.is_not_found() => {
            return Err(helpers::revision_err(&e, revision));
        }
        Err(e) => return Err(HubError::UpstreamUnavailable(e.to_string())),
    };

    let file_rows: std::collections::HashMap<String, db::FileRow> =
        db::list_files(&state.pool, &repo.id)
            .await?
            .into_iter()
            .map(|row| (row.path_in_repo.clone(), row))
            .collect();
    let policy = LfsPolicy::effective(repo, &state.config.app);

    let mut entries = Vec::with_capacity(objects.len());
    for object in &objects {
        let relative = object.path.strip_prefix(&prefix).unwrap_or(&object.path);

        if object.is_object() {
            entries.push(file_entry(
                object,
                relative,
                file_rows.get(&object.path),
                &policy,
            ));
        } else if object.is_common_prefix() {
            // Directory: size is the sum of descendants, lastModified the
            // max descendant mtime, oid opportunistically the first
            // child's checksum.
            let mut dir_size = 0i64;
            let mut latest_mtime = 0i64;
            let mut dir_oid = String::new();
            match state
                .lakefs
                .list_objects(&lakefs_repo, revision, &object.path, "", 1000, "")
                .await
            {
                Ok(children) => {
                    for child in children.results.iter().filter(|c| c.is_object()) {
                        dir_size += child.size_bytes;
                        latest_mtime = latest_mtime.max(child.mtime);
                        if dir_oid.is_empty() {
                            dir_oid.clone_from(&child.checksum);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(path = %object.path, error = %e, "folder stat failed");
                }
            }

            let mut entry = serde_json::json!({
                "type": "directory",
                "oid": dir_oid,
                "size": dir_size,
                "path": relative.trim_end_matches('/'),
            });
            if latest_mtime > 0 {
                entry["lastModified"] = helpers::format_hf_datetime(latest_mtime).into();
            }
            entries.push(entry);
        }
    }

    Ok(entries)
}

#[tracing::instrument(skip(state, user, query, body), fields(%namespace, %name, %revision), err)]
async fn paths_info(
    State(state): State<AppState>,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    Query(query): Query<PathsInfoQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
    body: String,
) -> Result<Json<Vec<serde_json::Value>>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;

    let repo = match helpers::get_repo(&state, repo_type, &namespace, &name).await {
        Ok(repo) => repo,
        // Best-effort: a local miss degrades to the peer's repo info.
        Err(HubError::RepoNotFound(id))
            if fallback::enabled_for_request(&state, query.fallback.as_deref()) =>
        {
            return match fallback::try_info(&state, repo_type, &namespace, &name).await {
                Some(info) => Ok(Json(vec![info])),
                None => Err(HubError::RepoNotFound(id)),
            };
        }
        Err(e) => return Err(e),
    };
    permissions::check_repo_read(&state.pool, &repo, user.as_ref().map(|u| &u.user)).await?;

    // HF clients send form data with repeated `paths` keys.
    let paths: Vec<String> = url::form_urlencoded::parse(body.as_bytes())
        .filter(|(key, _)| key == "paths" || key == "paths[]")
        .map(|(_, value)| value.into_owned())
        .collect();

    let lakefs_repo = lakefs_repo_name(repo_type, &repo.namespace, &repo.name);
    let policy = LfsPolicy::effective(&repo, &state.config.app);

    let mut result = Vec::new();
    for path in &paths {
        let clean = path.trim_start_matches('/');

        match state.lakefs.stat_object(&lakefs_repo, &revision, clean).await {
            Ok(stats) => {
                let row = db::get_file(&state.pool, &repo.id, clean).await?;
                let is_lfs = row
                    .as_ref()
                    .map_or_else(|| policy.is_lfs(clean, stats.size_bytes), |row| row.lfs);
                let checksum = row
                    .map(|row| row.sha256)
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| stats.checksum.clone());

                let mut info = serde_json::json!({
                    "type": "file",
                    "path": clean,
                    "size": stats.size_bytes,
                    "oid": checksum,
                    "lfs": null,
                    "last_commit": null,
                    "security": null,
                });
                if is_lfs {
                    info["lfs"] = serde_json::json!({
                        "oid": checksum,
                        "size": stats.size_bytes,
                        "pointerSize": 134,
                    });
                }
                result.push(info);
            }
            Err(e) if e.is_not_found() => {
                // Maybe a directory; missing paths are skipped entirely.
                let prefix = format!("{}/", clean.trim_end_matches('/'));
                if let Ok(children) = state
                    .lakefs
                    .list_objects(&lakefs_repo, &revision, &prefix, "", 1, "")
                    .await
                    && !children.results.is_empty()
                {
                    let oid = children.results[0].checksum.clone();
                    result.push(serde_json::json!({
                        "type": "directory",
                        "path": clean,
                        "oid": oid,
                        "tree_id": oid,
                        "last_commit": null,
                    }));
                }
            }
            Err(e) => return Err(HubError::UpstreamUnavailable(e.to_string())),
        }
    }

    Ok(Json(result))
}
