//! File resolve endpoint: HEAD serves metadata, GET redirects to a
//! presigned object-store URL and fires download accounting.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;

use crate::api::helpers;
use crate::auth::middleware::OptionalAuthUser;
use crate::auth::permissions;
use crate::db;
use crate::downloads;
use crate::error::HubError;
use crate::fallback::operations as fallback;
use crate::repo::{RepoType, lakefs_repo_name};
use crate::s3::{content_disposition, parse_s3_uri};
use crate::store::AppState;

const DOWNLOAD_EXPIRY: Duration = Duration::from_secs(3600);

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/models/{namespace}/{name}/resolve/{revision}/{*path}",
            get(resolve_model),
        )
        .route(
            "/datasets/{namespace}/{name}/resolve/{revision}/{*path}",
            get(resolve_dataset),
        )
        .route(
            "/spaces/{namespace}/{name}/resolve/{revision}/{*path}",
            get(resolve_space),
        )
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    fallback: Option<String>,
}

async fn resolve_model(
    state: State<AppState>,
    path: Path<(String, String, String, String)>,
    query: Query<ResolveQuery>,
    user: OptionalAuthUser,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, HubError> {
    resolve_impl(state, RepoType::Model, path, query, user, method, headers).await
}

async fn resolve_dataset(
    state: State<AppState>,
    path: Path<(String, String, String, String)>,
    query: Query<ResolveQuery>,
    user: OptionalAuthUser,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, HubError> {
    resolve_impl(state, RepoType::Dataset, path, query, user, method, headers).await
}

async fn resolve_space(
    state: State<AppState>,
    path: Path<(String, String, String, String)>,
    query: Query<ResolveQuery>,
    user: OptionalAuthUser,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, HubError> {
    resolve_impl(state, RepoType::Space, path, query, user, method, headers).await
}

fn http_date(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[allow(clippy::too_many_lines)]
#[tracing::instrument(skip_all, fields(%namespace, %name, %revision, %path), err)]
async fn resolve_impl(
    State(state): State<AppState>,
    repo_type: RepoType,
    Path((namespace, name, revision, path)): Path<(String, String, String, String)>,
    Query(query): Query<ResolveQuery>,
    OptionalAuthUser(user): OptionalAuthUser,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, HubError> {
    let local = resolve_local(
        &state, repo_type, &namespace, &name, &revision, &path, user.as_ref(), &method, &headers,
    )
    .await;

    match local {
        Ok(response) => Ok(response),
        // Only a local 404 enters the fallback chain.
        Err(
            e @ (HubError::RepoNotFound(_)
            | HubError::RevisionNotFound(_)
            | HubError::EntryNotFound(_)),
        ) if fallback::enabled_for_request(&state, query.fallback.as_deref()) => {
            match fallback::try_resolve(&state, repo_type, &namespace, &name, &revision, &path)
                .await
            {
                Some(response) => Ok(response),
                None => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn resolve_local(
    state: &AppState,
    repo_type: RepoType,
    namespace: &str,
    name: &str,
    revision: &str,
    path: &str,
    user: Option<&crate::auth::middleware::AuthUser>,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response, HubError> {
    let repo = helpers::get_repo(state, repo_type, namespace, name).await?;
    permissions::check_repo_read(&state.pool, &repo, user.map(|u| &u.user)).await?;

    let lakefs_repo = lakefs_repo_name(repo_type, namespace, name);

    let stats = match state.lakefs.stat_object(&lakefs_repo, revision, path).await {
        Ok(stats) => stats,
        Err(e) if e.is_not_found() => {
            // Distinguish a missing revision from a missing file.
            let (head, _) = helpers::branch_head_info(state, &repo, revision).await;
            return Err(if head.is_none() {
                HubError::RevisionNotFound(revision.to_owned())
            } else {
                HubError::EntryNotFound(path.to_owned())
            });
        }
        Err(e) => return Err(HubError::UpstreamUnavailable(e.to_string())),
    };

    let (commit_sha, _) = helpers::branch_head_info(state, &repo, revision).await;
    let commit_sha =
        commit_sha.ok_or_else(|| HubError::RevisionNotFound(revision.to_owned()))?;

    // Canonical checksum to advertise: git-blob SHA-1 for regular files,
    // SHA-256 for LFS, from the File row when we have one.
    let etag = db::get_file(&state.pool, &repo.id, path)
        .await?
        .map(|row| row.sha256)
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| stats.checksum.clone());

    let filename = path.rsplit('/').next().unwrap_or(path);
    let content_type = stats
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_owned());

    let mut builder = Response::builder()
        .header("x-repo-commit", &commit_sha)
        .header("x-linked-etag", &etag)
        .header("x-linked-size", stats.size_bytes.to_string())
        .header("etag", &etag)
        .header("content-length", stats.size_bytes.to_string())
        .header("accept-ranges", "bytes")
        .header("content-type", &content_type)
        .header("content-disposition", content_disposition(filename));
    if stats.mtime > 0 {
        builder = builder.header("last-modified", http_date(stats.mtime));
    }

    if *method == Method::HEAD {
        return builder
            .status(StatusCode::OK)
            .body(Body::empty())
            .map_err(|e| HubError::Internal(e.into()));
    }

    // GET: 302 to a presigned URL against the physical address.
    let (bucket, key) = parse_s3_uri(&stats.physical_address)
        .map_err(|_| HubError::Internal(anyhow::anyhow!(
            "unsupported physical address: {}",
            stats.physical_address
        )))?;
    if bucket != state.s3.bucket {
        return Err(HubError::Internal(anyhow::anyhow!(
            "physical address outside configured bucket: {bucket}"
        )));
    }

    let presigned = state
        .s3
        .generate_download_presigned_url(key, DOWNLOAD_EXPIRY, Some(filename))
        .await
        .map_err(HubError::Internal)?;

    // Accounting must never fail the download.
    let (session_id, fresh_cookie) = downloads::resolve_session_id(headers, user.is_some());
    downloads::spawn_track_download(
        state,
        repo.id.clone(),
        path.to_owned(),
        session_id,
        user.map(|u| u.user.id.clone()),
    );

    let mut builder = builder
        .status(StatusCode::FOUND)
        .header(axum::http::header::LOCATION, presigned);
    if let Some(cookie) = fresh_cookie {
        builder = builder.header(axum::http::header::SET_COOKIE, cookie);
    }

    builder
        .body(Body::empty())
        .map_err(|e| HubError::Internal(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_format() {
        assert_eq!(http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(http_date(1_700_000_000), "Tue, 14 Nov 2023 22:13:20 GMT");
    }
}
