//! Row types and shared query helpers.
//!
//! All SQL uses `$n` placeholders, which both postgres and sqlite accept,
//! so every statement here runs unchanged on either backend through the
//! sqlx `Any` driver. Timestamps are unix seconds; dates are ISO strings.

use sqlx::AnyPool;
use uuid::Uuid;

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh text uuid for a primary key.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Case-folded name used for uniqueness checks across principals.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub is_active: bool,
    pub private_quota_bytes: Option<i64>,
    pub public_quota_bytes: Option<i64>,
    pub private_used_bytes: i64,
    pub public_used_bytes: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub private_quota_bytes: Option<i64>,
    pub public_quota_bytes: Option<i64>,
    pub private_used_bytes: i64,
    pub public_used_bytes: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Membership {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    pub role: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub name: String,
    pub last_used: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Repository {
    pub id: String,
    pub repo_type: String,
    pub namespace: String,
    pub name: String,
    pub full_id: String,
    pub private: bool,
    pub owner_id: String,
    pub quota_bytes: Option<i64>,
    pub used_bytes: i64,
    pub lfs_threshold_bytes: Option<i64>,
    pub lfs_keep_versions: Option<i64>,
    pub lfs_suffix_rules: Option<String>,
    pub downloads: i64,
    pub likes_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRow {
    pub id: String,
    pub repository_id: String,
    pub path_in_repo: String,
    pub size: i64,
    pub sha256: String,
    pub lfs: bool,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommitRow {
    pub id: String,
    pub commit_id: String,
    pub repository_id: String,
    pub repo_type: String,
    pub branch: String,
    pub author_id: String,
    pub username: String,
    pub message: String,
    pub description: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LfsHistoryRow {
    pub id: String,
    pub repository_id: String,
    pub path_in_repo: String,
    pub sha256: String,
    pub size: i64,
    pub commit_id: String,
    pub file_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DownloadSessionRow {
    pub id: String,
    pub repository_id: String,
    pub user_id: Option<String>,
    pub session_id: String,
    pub time_bucket: i64,
    pub file_count: i64,
    pub first_file: String,
    pub first_download_at: i64,
    pub last_download_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DailyStatRow {
    pub id: String,
    pub repository_id: String,
    pub date: String,
    pub download_sessions: i64,
    pub authenticated_downloads: i64,
    pub anonymous_downloads: i64,
    pub total_files: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FallbackSourceRow {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub base_url: String,
    pub token: Option<String>,
    pub priority: i64,
    pub source_type: String,
    pub enabled: bool,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

pub async fn get_user_by_name(pool: &AnyPool, name: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>(r#"SELECT * FROM "user" WHERE name = $1"#)
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_id(pool: &AnyPool, id: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>(r#"SELECT * FROM "user" WHERE id = $1"#)
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_organization_by_name(
    pool: &AnyPool,
    name: &str,
) -> sqlx::Result<Option<Organization>> {
    sqlx::query_as::<_, Organization>("SELECT * FROM organization WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn get_membership(
    pool: &AnyPool,
    user_id: &str,
    org_id: &str,
) -> sqlx::Result<Option<Membership>> {
    sqlx::query_as::<_, Membership>(
        "SELECT * FROM userorganization WHERE user_id = $1 AND organization_id = $2",
    )
    .bind(user_id)
    .bind(org_id)
    .fetch_optional(pool)
    .await
}

/// Names of every organization the user belongs to (any role).
pub async fn list_user_org_names(pool: &AnyPool, user_id: &str) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT o.name FROM organization o
         JOIN userorganization uo ON uo.organization_id = o.id
         WHERE uo.user_id = $1",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

// ---------------------------------------------------------------------------
// Sessions and tokens
// ---------------------------------------------------------------------------

pub async fn get_session(pool: &AnyPool, session_id: &str) -> sqlx::Result<Option<SessionRow>> {
    sqlx::query_as::<_, SessionRow>("SELECT * FROM session WHERE session_id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
}

pub async fn create_session(
    pool: &AnyPool,
    session_id: &str,
    user_id: &str,
    expires_at: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO session (id, session_id, user_id, expires_at, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(new_id())
    .bind(session_id)
    .bind(user_id)
    .bind(expires_at)
    .bind(now_unix())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_session(pool: &AnyPool, session_id: &str) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM session WHERE session_id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_token_by_hash(pool: &AnyPool, hash: &str) -> sqlx::Result<Option<TokenRow>> {
    sqlx::query_as::<_, TokenRow>("SELECT * FROM token WHERE token_hash = $1")
        .bind(hash)
        .fetch_optional(pool)
        .await
}

/// Best-effort `last_used` bump; failures are swallowed by callers.
pub async fn touch_token(pool: &AnyPool, token_id: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE token SET last_used = $1 WHERE id = $2")
        .bind(now_unix())
        .bind(token_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

pub async fn get_repository(
    pool: &AnyPool,
    repo_type: &str,
    namespace: &str,
    name: &str,
) -> sqlx::Result<Option<Repository>> {
    sqlx::query_as::<_, Repository>(
        "SELECT * FROM repository WHERE repo_type = $1 AND namespace = $2 AND name = $3",
    )
    .bind(repo_type)
    .bind(namespace)
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Look a repository up by `namespace/name` alone, trying each type.
/// Git smart HTTP URLs carry no repo type.
pub async fn find_repository_any_type(
    pool: &AnyPool,
    namespace: &str,
    name: &str,
) -> sqlx::Result<Option<Repository>> {
    for repo_type in ["model", "dataset", "space"] {
        if let Some(repo) = get_repository(pool, repo_type, namespace, name).await? {
            return Ok(Some(repo));
        }
    }
    Ok(None)
}

pub async fn list_repositories_by_type(
    pool: &AnyPool,
    repo_type: &str,
    author: Option<&str>,
) -> sqlx::Result<Vec<Repository>> {
    match author {
        Some(author) => {
            sqlx::query_as::<_, Repository>(
                "SELECT * FROM repository WHERE repo_type = $1 AND namespace = $2
                 ORDER BY created_at DESC",
            )
            .bind(repo_type)
            .bind(author)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Repository>(
                "SELECT * FROM repository WHERE repo_type = $1 ORDER BY created_at DESC",
            )
            .bind(repo_type)
            .fetch_all(pool)
            .await
        }
    }
}

pub async fn list_namespace_repositories(
    pool: &AnyPool,
    namespace: &str,
) -> sqlx::Result<Vec<Repository>> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repository WHERE namespace = $1")
        .bind(namespace)
        .fetch_all(pool)
        .await
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Live (non-deleted) file row at a path.
pub async fn get_file(
    pool: &AnyPool,
    repository_id: &str,
    path: &str,
) -> sqlx::Result<Option<FileRow>> {
    sqlx::query_as::<_, FileRow>(
        "SELECT * FROM file
         WHERE repository_id = $1 AND path_in_repo = $2 AND is_deleted = $3",
    )
    .bind(repository_id)
    .bind(path)
    .bind(false)
    .fetch_optional(pool)
    .await
}

/// Global content-address lookup used for LFS dedup.
pub async fn get_file_by_sha256(pool: &AnyPool, sha256: &str) -> sqlx::Result<Option<FileRow>> {
    sqlx::query_as::<_, FileRow>("SELECT * FROM file WHERE sha256 = $1 AND is_deleted = $2")
        .bind(sha256)
        .bind(false)
        .fetch_optional(pool)
        .await
}

pub async fn list_files(pool: &AnyPool, repository_id: &str) -> sqlx::Result<Vec<FileRow>> {
    sqlx::query_as::<_, FileRow>("SELECT * FROM file WHERE repository_id = $1 AND is_deleted = $2")
        .bind(repository_id)
        .bind(false)
        .fetch_all(pool)
        .await
}

// ---------------------------------------------------------------------------
// Commits and LFS history
// ---------------------------------------------------------------------------

pub async fn get_commit_author(
    pool: &AnyPool,
    repository_id: &str,
    commit_id: &str,
) -> sqlx::Result<Option<CommitRow>> {
    sqlx::query_as::<_, CommitRow>(
        r#"SELECT * FROM "commit" WHERE repository_id = $1 AND commit_id = $2"#,
    )
    .bind(repository_id)
    .bind(commit_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_lfs_history(
    pool: &AnyPool,
    repository_id: &str,
) -> sqlx::Result<Vec<LfsHistoryRow>> {
    sqlx::query_as::<_, LfsHistoryRow>("SELECT * FROM lfsobjecthistory WHERE repository_id = $1")
        .bind(repository_id)
        .fetch_all(pool)
        .await
}

// ---------------------------------------------------------------------------
// Fallback sources
// ---------------------------------------------------------------------------

/// Enabled sources scoped to `namespace` plus globals, priority ascending
/// (stable on ties via creation order).
pub async fn enabled_fallback_sources(
    pool: &AnyPool,
    namespace: &str,
) -> sqlx::Result<Vec<FallbackSourceRow>> {
    sqlx::query_as::<_, FallbackSourceRow>(
        "SELECT * FROM fallbacksource
         WHERE enabled = $1 AND (namespace = $2 OR namespace = $3)
         ORDER BY priority ASC, created_at ASC",
    )
    .bind(true)
    .bind("")
    .bind(namespace)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_names_fold_case_and_dashes() {
        assert_eq!(normalize_name("Alice-Dev"), "alice_dev");
        assert_eq!(normalize_name("alice_dev"), "alice_dev");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
