//! Git Smart HTTP endpoints: ref advertisement, upload-pack (clone and
//! fetch served from synthesized packs) and receive-pack (parsed, then
//! refused; pushes go through the upload API).

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use serde::Deserialize;

use crate::auth::middleware::authenticate_git_basic;
use crate::auth::permissions;
use crate::db::{self, Repository, User};
use crate::error::HubError;
use crate::git::{bridge, objects};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{namespace}/{repo}/info/refs", get(info_refs))
        .route("/{namespace}/{repo}/git-upload-pack", post(upload_pack))
        .route("/{namespace}/{repo}/git-receive-pack", post(receive_pack))
        .route("/{namespace}/{repo}/HEAD", get(head_ref))
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// Git URLs carry no repo type, so resolve `namespace/name` across all
/// three. The `.git` suffix is optional.
async fn resolve_repo(
    state: &AppState,
    namespace: &str,
    repo: &str,
) -> Result<Repository, HubError> {
    let name = repo.strip_suffix(".git").unwrap_or(repo);
    db::find_repository_any_type(&state.pool, namespace, name)
        .await?
        .ok_or_else(|| HubError::RepoNotFound(format!("{namespace}/{name}")))
}

/// Auth + permission gate shared by all git endpoints. Read operations
/// on public repos pass anonymously; everything else needs a token in
/// the Basic-auth password field.
async fn check_git_access(
    state: &AppState,
    headers: &HeaderMap,
    repo: &Repository,
    is_read: bool,
) -> Result<Option<User>, HubError> {
    let user = authenticate_git_basic(state, headers).await?;

    if is_read {
        permissions::check_repo_read(&state.pool, repo, user.as_ref()).await?;
        return Ok(user);
    }

    let Some(user) = user else {
        return Err(HubError::Unauthorized);
    };
    permissions::check_repo_write(&state.pool, repo, &user).await?;
    Ok(Some(user))
}

fn git_response(content_type: &str, body: Vec<u8>) -> Response {
    Response::builder()
        .header("content-type", content_type)
        .header("cache-control", "no-cache")
        .body(Body::from(body))
        .expect("response builder")
}

/// `GET /{ns}/{name}.git/info/refs?service=git-upload-pack|git-receive-pack`
#[tracing::instrument(skip(state, headers), fields(%namespace, %repo), err)]
async fn info_refs(
    State(state): State<AppState>,
    Path((namespace, repo)): Path<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, HubError> {
    let service = query
        .service
        .as_deref()
        .ok_or_else(|| HubError::BadRequest("service query parameter required".into()))?;

    if service != "git-upload-pack" && service != "git-receive-pack" {
        return Err(HubError::BadRequest(format!("unknown service: {service}")));
    }

    let repo_row = resolve_repo(&state, &namespace, &repo).await?;
    check_git_access(&state, &headers, &repo_row, service == "git-upload-pack").await?;

    let refs = bridge::get_refs(&state, &repo_row).await?;
    let capabilities = if service == "git-upload-pack" {
        bridge::upload_pack_capabilities()
    } else {
        bridge::receive_pack_capabilities()
    };

    let body = bridge::service_advertisement(service, &refs, &capabilities);
    Ok(git_response(
        &format!("application/x-{service}-advertisement"),
        body,
    ))
}

/// `POST /{ns}/{name}.git/git-upload-pack`: clone and fetch.
#[tracing::instrument(skip(state, headers, body), fields(%namespace, %repo), err)]
async fn upload_pack(
    State(state): State<AppState>,
    Path((namespace, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HubError> {
    let repo_row = resolve_repo(&state, &namespace, &repo).await?;
    check_git_access(&state, &headers, &repo_row, true).await?;

    let request = bridge::parse_upload_pack_request(&body);
    tracing::debug!(
        wants = request.wants.len(),
        haves = request.haves.len(),
        "upload-pack negotiation"
    );

    let pack = match bridge::build_snapshot(&state, &repo_row).await? {
        Some(snapshot) => {
            let objects = snapshot.objects;
            tokio::task::spawn_blocking(move || objects::pack_file(&objects))
                .await
                .map_err(|e| HubError::Internal(e.into()))?
        }
        None => objects::empty_pack(),
    };

    let body = bridge::upload_pack_response(&pack);
    Ok(git_response("application/x-git-upload-pack-result", body))
}

/// `POST /{ns}/{name}.git/git-receive-pack`: push (refused per ref).
#[tracing::instrument(skip(state, headers, body), fields(%namespace, %repo), err)]
async fn receive_pack(
    State(state): State<AppState>,
    Path((namespace, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HubError> {
    let repo_row = resolve_repo(&state, &namespace, &repo).await?;
    check_git_access(&state, &headers, &repo_row, false).await?;

    let commands = bridge::parse_receive_pack_commands(&body);
    tracing::info!(commands = commands.len(), "push refused (not supported)");

    let body = bridge::receive_pack_response(&commands);
    Ok(git_response("application/x-git-receive-pack-result", body))
}

/// `GET /{ns}/{name}.git/HEAD`
#[tracing::instrument(skip(state, headers), fields(%namespace, %repo), err)]
async fn head_ref(
    State(state): State<AppState>,
    Path((namespace, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, HubError> {
    let repo_row = resolve_repo(&state, &namespace, &repo).await?;
    check_git_access(&state, &headers, &repo_row, true).await?;

    Ok(git_response("text/plain", b"ref: refs/heads/main\n".to_vec()))
}
