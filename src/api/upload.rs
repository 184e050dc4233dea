//! Upload pipeline stages A (preupload negotiation) and D (commit
//! promotion). Stage B runs against the object store via presigned URLs
//! from the LFS batch endpoint; stage C is the LFS verify endpoint.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::api::helpers;
use crate::auth::middleware::AuthUser;
use crate::auth::permissions;
use crate::db::{self, Repository};
use crate::error::HubError;
use crate::lakefs::StagingMetadata;
use crate::quota;
use crate::repo::{LfsPolicy, RepoType, lakefs_repo_name};
use crate::s3::{is_valid_lfs_oid, lfs_key};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/{repo_type}/{namespace}/{name}/preupload/{revision}",
            post(preupload),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/commit/{revision}",
            post(commit),
        )
}

// ---------------------------------------------------------------------------
// Stage A: preupload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PreuploadRequest {
    files: Vec<PreuploadFile>,
}

#[derive(Debug, Deserialize)]
struct PreuploadFile {
    path: String,
    size: i64,
    sha256: Option<String>,
    /// Small base64 content sample used for dedup when no hash is given.
    sample: Option<String>,
}

#[derive(Debug, Serialize)]
struct PreuploadResponseFile {
    path: String,
    #[serde(rename = "uploadMode")]
    upload_mode: &'static str,
    #[serde(rename = "shouldIgnore")]
    should_ignore: bool,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}

/// Git blob SHA-1 of raw content; the canonical checksum recorded for
/// non-LFS files.
fn git_blob_sha1(content: &[u8]) -> String {
    crate::git::objects::blob_object(content).sha1_hex()
}

/// Dedup check: an identical non-deleted file at the same path, or a
/// byte-identical object already on the revision.
async fn should_ignore(
    state: &AppState,
    repo: &Repository,
    lakefs_repo: &str,
    revision: &str,
    file: &PreuploadFile,
) -> Result<bool, HubError> {
    if let Some(sha256) = file.sha256.as_deref()
        && let Some(existing) = db::get_file(&state.pool, &repo.id, &file.path).await?
        && existing.sha256 == sha256
        && existing.size == file.size
    {
        return Ok(true);
    }

    if let Some(sample) = file.sample.as_deref() {
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(sample) else {
            return Ok(false);
        };
        match state.lakefs.stat_object(lakefs_repo, revision, &file.path).await {
            Ok(stats) if stats.size_bytes == file.size => {
                if let Ok(stored) = state
                    .lakefs
                    .get_object(lakefs_repo, revision, &file.path)
                    .await
                    && sha256_hex(&decoded) == sha256_hex(&stored)
                {
                    return Ok(true);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(HubError::UpstreamUnavailable(e.to_string())),
        }
    }

    Ok(false)
}

#[tracing::instrument(skip(state, auth, body), fields(%namespace, %name, %revision), err)]
async fn preupload(
    State(state): State<AppState>,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    auth: AuthUser,
    Json(body): Json<PreuploadRequest>,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
    permissions::check_repo_write(&state.pool, &repo, &auth.user).await?;

    let lakefs_repo = lakefs_repo_name(repo_type, &namespace, &name);
    let policy = LfsPolicy::effective(&repo, &state.config.app);

    let mut files = Vec::with_capacity(body.files.len());
    let mut pending_bytes = 0i64;

    for file in &body.files {
        let is_lfs = policy.is_lfs(&file.path, file.size);
        let ignore = should_ignore(&state, &repo, &lakefs_repo, &revision, file).await?;
        if !ignore {
            pending_bytes += file.size;

            // Staging row is keyed by (repo, revision, path): a retried
            // negotiation overwrites rather than appends.
            let storage_key = if is_lfs {
                match file.sha256.as_deref() {
                    Some(oid) if is_valid_lfs_oid(oid) => lfs_key(oid),
                    Some(oid) => {
                        return Err(HubError::BadRequest(format!(
                            "sha256 must be a 64-hex digest, got: {oid}"
                        )));
                    }
                    None => String::new(),
                }
            } else {
                format!("{lakefs_repo}/{}", file.path)
            };
            sqlx::query(
                "INSERT INTO stagingupload
                 (id, repository_id, revision, path_in_repo, sha256, size, storage_key, lfs,
                  upload_id, uploader_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (repository_id, revision, path_in_repo) DO UPDATE SET
                   sha256 = $5, size = $6, storage_key = $7, lfs = $8, uploader_id = $10,
                   created_at = $11",
            )
            .bind(db::new_id())
            .bind(&repo.id)
            .bind(&revision)
            .bind(&file.path)
            .bind(file.sha256.as_deref().unwrap_or(""))
            .bind(file.size)
            .bind(&storage_key)
            .bind(is_lfs)
            .bind(None::<String>)
            .bind(&auth.user.id)
            .bind(db::now_unix())
            .execute(&state.pool)
            .await?;
        }

        files.push(PreuploadResponseFile {
            path: file.path.clone(),
            upload_mode: if is_lfs { "lfs" } else { "regular" },
            should_ignore: ignore,
        });
    }

    // Admission before any presigned URL is handed out.
    quota::check_quota(&state.pool, &namespace, pending_bytes, repo.private).await?;

    Ok(Json(serde_json::json!({ "files": files })))
}

// ---------------------------------------------------------------------------
// Stage D: commit promotion
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommitLine {
    key: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CommitHeader {
    summary: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct CommitRegularFile {
    path: String,
    content: String,
    #[serde(default = "default_encoding")]
    encoding: String,
}

fn default_encoding() -> String {
    "base64".to_owned()
}

#[derive(Debug, Deserialize)]
struct CommitLfsFile {
    path: String,
    oid: String,
    size: i64,
    #[allow(dead_code)]
    algo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitDeletedFile {
    path: String,
}

#[derive(Debug)]
enum Operation {
    Regular(CommitRegularFile),
    Lfs(CommitLfsFile),
    Delete(CommitDeletedFile),
}

fn parse_commit_payload(body: &str) -> Result<(CommitHeader, Vec<Operation>), HubError> {
    let mut header = None;
    let mut operations = Vec::new();

    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let parsed: CommitLine = serde_json::from_str(line)
            .map_err(|e| HubError::BadRequest(format!("malformed commit line: {e}")))?;
        match parsed.key.as_str() {
            "header" => {
                header = Some(
                    serde_json::from_value::<CommitHeader>(parsed.value)
                        .map_err(|e| HubError::BadRequest(format!("bad commit header: {e}")))?,
                );
            }
            "file" => operations.push(Operation::Regular(
                serde_json::from_value(parsed.value)
                    .map_err(|e| HubError::BadRequest(format!("bad file entry: {e}")))?,
            )),
            "lfsFile" => operations.push(Operation::Lfs(
                serde_json::from_value(parsed.value)
                    .map_err(|e| HubError::BadRequest(format!("bad lfsFile entry: {e}")))?,
            )),
            "deletedFile" => operations.push(Operation::Delete(
                serde_json::from_value(parsed.value)
                    .map_err(|e| HubError::BadRequest(format!("bad deletedFile entry: {e}")))?,
            )),
            other => {
                return Err(HubError::BadRequest(format!("unknown commit key: {other}")));
            }
        }
    }

    let header =
        header.ok_or_else(|| HubError::BadRequest("commit payload missing header".into()))?;
    Ok((header, operations))
}

#[tracing::instrument(skip(state, auth, body), fields(%namespace, %name, %revision), err)]
async fn commit(
    State(state): State<AppState>,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    auth: AuthUser,
    body: String,
) -> Result<Json<serde_json::Value>, HubError> {
    let repo_type = RepoType::parse_plural(&repo_type)?;
    let repo = helpers::get_repo(&state, repo_type, &namespace, &name).await?;
    permissions::check_repo_write(&state.pool, &repo, &auth.user).await?;

    let (header, operations) = parse_commit_payload(&body)?;
    if operations.is_empty() {
        return Err(HubError::BadRequest("commit has no operations".into()));
    }

    let lakefs_repo = lakefs_repo_name(repo_type, &namespace, &name);
    let policy = LfsPolicy::effective(&repo, &state.config.app);
    let now = db::now_unix();

    // Phase 1: stage every operation on the branch. Per-file effects on
    // the branch are uncommitted in the store until the final commit.
    struct FileMutation {
        path: String,
        size: i64,
        checksum: String,
        lfs: bool,
        delete: bool,
    }
    let mut mutations = Vec::with_capacity(operations.len());
    let mut storage_delta = 0i64;

    for operation in &operations {
        match operation {
            Operation::Regular(file) => {
                if file.encoding != "base64" {
                    return Err(HubError::BadRequest(format!(
                        "unsupported encoding: {}",
                        file.encoding
                    )));
                }
                let content = base64::engine::general_purpose::STANDARD
                    .decode(&file.content)
                    .map_err(|e| HubError::BadRequest(format!("bad base64 content: {e}")))?;
                let size = i64::try_from(content.len()).unwrap_or(i64::MAX);
                let checksum = git_blob_sha1(&content);

                state
                    .lakefs
                    .upload_object(&lakefs_repo, "main", &file.path, content)
                    .await
                    .map_err(|e| HubError::UpstreamUnavailable(e.to_string()))?;

                let old = db::get_file(&state.pool, &repo.id, &file.path).await?;
                storage_delta += size - old.map_or(0, |old| old.size);
                mutations.push(FileMutation {
                    path: file.path.clone(),
                    size,
                    checksum,
                    lfs: false,
                    delete: false,
                });
            }
            Operation::Lfs(file) => {
                if !is_valid_lfs_oid(&file.oid) {
                    return Err(HubError::BadRequest(format!("invalid LFS oid: {}", file.oid)));
                }
                let key = lfs_key(&file.oid);
                let physical = format!("s3://{}/{key}", state.s3.bucket);
                state
                    .lakefs
                    .link_physical_address(
                        &lakefs_repo,
                        "main",
                        &file.path,
                        &StagingMetadata {
                            physical_address: physical,
                            checksum: file.oid.clone(),
                            size_bytes: file.size,
                        },
                    )
                    .await
                    .map_err(|e| HubError::UpstreamUnavailable(e.to_string()))?;

                let old = db::get_file(&state.pool, &repo.id, &file.path).await?;
                // Branch delta plus a retained history version.
                storage_delta += file.size - old.map_or(0, |old| old.size);
                storage_delta += file.size;
                mutations.push(FileMutation {
                    path: file.path.clone(),
                    size: file.size,
                    checksum: file.oid.clone(),
                    lfs: true,
                    delete: false,
                });
            }
            Operation::Delete(file) => {
                match state.lakefs.delete_object(&lakefs_repo, "main", &file.path).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(HubError::UpstreamUnavailable(e.to_string())),
                }
                if let Some(old) = db::get_file(&state.pool, &repo.id, &file.path).await? {
                    storage_delta -= old.size;
                }
                mutations.push(FileMutation {
                    path: file.path.clone(),
                    size: 0,
                    checksum: String::new(),
                    lfs: false,
                    delete: true,
                });
            }
        }
    }

    // Phase 2: one DB transaction around the row mutations, with the
    // store commit issued before the transaction commits so a store
    // failure rolls everything back.
    let mut tx = state.pool.begin().await?;

    for mutation in &mutations {
        if mutation.delete {
            sqlx::query(
                "UPDATE file SET is_deleted = $1, updated_at = $2
                 WHERE repository_id = $3 AND path_in_repo = $4",
            )
            .bind(true)
            .bind(now)
            .bind(&repo.id)
            .bind(&mutation.path)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO file
                 (id, repository_id, path_in_repo, size, sha256, lfs, is_deleted,
                  created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (repository_id, path_in_repo) DO UPDATE SET
                   size = $4, sha256 = $5, lfs = $6, is_deleted = $7, updated_at = $9",
            )
            .bind(db::new_id())
            .bind(&repo.id)
            .bind(&mutation.path)
            .bind(mutation.size)
            .bind(&mutation.checksum)
            .bind(mutation.lfs)
            .bind(false)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        // Staging rows are consumed by promotion.
        sqlx::query(
            "DELETE FROM stagingupload
             WHERE repository_id = $1 AND revision = $2 AND path_in_repo = $3",
        )
        .bind(&repo.id)
        .bind(&revision)
        .bind(&mutation.path)
        .execute(&mut *tx)
        .await?;
    }

    let message = if header.summary.is_empty() {
        "Update repository".to_owned()
    } else {
        header.summary.clone()
    };
    let store_commit = state
        .lakefs
        .commit(
            &lakefs_repo,
            "main",
            &message,
            Some(&serde_json::json!({"author": auth.user.name})),
        )
        .await
        .map_err(|e| HubError::UpstreamUnavailable(format!("store commit failed: {e}")))?;

    sqlx::query(
        r#"INSERT INTO "commit"
           (id, commit_id, repository_id, repo_type, branch, author_id, username, message,
            description, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
    )
    .bind(db::new_id())
    .bind(&store_commit.id)
    .bind(&repo.id)
    .bind(repo_type.as_str())
    .bind("main")
    .bind(&auth.user.id)
    .bind(&auth.user.name)
    .bind(&message)
    .bind(&header.description)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for mutation in mutations.iter().filter(|m| m.lfs) {
        let file_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM file WHERE repository_id = $1 AND path_in_repo = $2",
        )
        .bind(&repo.id)
        .bind(&mutation.path)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO lfsobjecthistory
             (id, repository_id, path_in_repo, sha256, size, commit_id, file_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(db::new_id())
        .bind(&repo.id)
        .bind(&mutation.path)
        .bind(&mutation.checksum)
        .bind(mutation.size)
        .bind(&store_commit.id)
        .bind(file_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE repository SET used_bytes = used_bytes + $1 WHERE id = $2")
        .bind(storage_delta)
        .bind(&repo.id)
        .execute(&mut *tx)
        .await?;

    if let Err(e) = tx.commit().await {
        // The store commit landed but the rows did not: record the drift
        // so an admin recalculation can repair usage.
        tracing::error!(
            repo = %repo.full_id,
            store_commit = %store_commit.id,
            error = %e,
            "commit promotion drift: store committed, DB rollback"
        );
        return Err(e.into());
    }

    quota::increment_storage(&state.pool, &namespace, storage_delta, repo.private).await?;

    // Retention runs off the request path.
    enforce_lfs_retention(&state, &repo, policy.keep_versions);

    tracing::info!(
        repo = %repo.full_id,
        commit = %store_commit.id,
        operations = operations.len(),
        "commit promoted"
    );

    Ok(Json(serde_json::json!({
        "commitUrl": format!(
            "{}/{}/{}/commit/{}",
            state.config.app.base_url,
            repo_type.plural(),
            repo.full_id,
            store_commit.id
        ),
        "commitOid": store_commit.id,
        "pullRequestUrl": null,
    })))
}

/// Keep only the newest N history rows per (repo, path); blobs that no
/// history or file row references any more are deleted from storage.
fn enforce_lfs_retention(state: &AppState, repo: &Repository, keep_versions: i64) {
    if keep_versions <= 0 {
        return;
    }
    let state = state.clone();
    let repo_id = repo.id.clone();
    let full_id = repo.full_id.clone();

    tokio::spawn(async move {
        let result: anyhow::Result<()> = async {
            let history = db::list_lfs_history(&state.pool, &repo_id).await?;

            let mut by_path: std::collections::HashMap<&str, Vec<&db::LfsHistoryRow>> =
                std::collections::HashMap::new();
            for row in &history {
                by_path.entry(row.path_in_repo.as_str()).or_default().push(row);
            }

            for rows in by_path.values_mut() {
                rows.sort_by_key(|row| std::cmp::Reverse(row.created_at));
                for stale in rows.iter().skip(usize::try_from(keep_versions).unwrap_or(0)) {
                    sqlx::query("DELETE FROM lfsobjecthistory WHERE id = $1")
                        .bind(&stale.id)
                        .execute(&state.pool)
                        .await?;

                    let still_referenced: i64 = sqlx::query_scalar(
                        "SELECT (SELECT COUNT(*) FROM lfsobjecthistory WHERE sha256 = $1)
                              + (SELECT COUNT(*) FROM file WHERE sha256 = $1 AND is_deleted = $2)",
                    )
                    .bind(&stale.sha256)
                    .bind(false)
                    .fetch_one(&state.pool)
                    .await?;

                    if still_referenced == 0 {
                        let key = lfs_key(&stale.sha256);
                        if let Err(e) = state.s3.delete_objects_with_prefix(&key).await {
                            tracing::warn!(key, error = %e, "stale LFS blob cleanup failed");
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(repo = %full_id, error = %e, "LFS retention pass failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_payload_round_trip() {
        let body = concat!(
            r#"{"key":"header","value":{"summary":"add weights","description":"v2"}}"#,
            "\n",
            r#"{"key":"file","value":{"path":"README.md","content":"aGVsbG8=","encoding":"base64"}}"#,
            "\n",
            r#"{"key":"lfsFile","value":{"path":"model.bin","algo":"sha256","oid":"aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899","size":1024}}"#,
            "\n",
            r#"{"key":"deletedFile","value":{"path":"old.txt"}}"#,
        );
        let (header, operations) = parse_commit_payload(body).unwrap();
        assert_eq!(header.summary, "add weights");
        assert_eq!(header.description, "v2");
        assert_eq!(operations.len(), 3);
        assert!(matches!(operations[0], Operation::Regular(_)));
        assert!(matches!(operations[1], Operation::Lfs(_)));
        assert!(matches!(operations[2], Operation::Delete(_)));
    }

    #[test]
    fn commit_payload_requires_header() {
        let body = r#"{"key":"deletedFile","value":{"path":"x"}}"#;
        assert!(matches!(
            parse_commit_payload(body),
            Err(HubError::BadRequest(_))
        ));
    }

    #[test]
    fn commit_payload_rejects_unknown_keys() {
        let body = r#"{"key":"mystery","value":{}}"#;
        assert!(parse_commit_payload(body).is_err());
    }

    #[test]
    fn git_blob_sha1_matches_git() {
        // `echo 'test content' | git hash-object --stdin`
        assert_eq!(
            git_blob_sha1(b"test content\n"),
            "d670460b4b4aece5915caf5c68d12f560a9fe3e4"
        );
    }

    #[test]
    fn empty_content_hashes() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
