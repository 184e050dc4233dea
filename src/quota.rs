//! Storage quota engine: pre-upload admission, signed usage deltas on
//! commit/delete, and full recalculation for drift repair.
//!
//! Quotas are tracked per principal, split into private and public pools;
//! a `NULL` quota means unlimited.

use sqlx::AnyPool;

use crate::db::{self, Repository};
use crate::error::HubError;
use crate::repo::RepoType;
use crate::store::AppState;

#[derive(Debug, Clone, Copy)]
struct NamespaceUsage {
    quota_bytes: Option<i64>,
    used_bytes: i64,
}

async fn namespace_usage(
    pool: &AnyPool,
    namespace: &str,
    is_private: bool,
) -> Result<Option<NamespaceUsage>, HubError> {
    if let Some(user) = db::get_user_by_name(pool, namespace).await? {
        return Ok(Some(if is_private {
            NamespaceUsage {
                quota_bytes: user.private_quota_bytes,
                used_bytes: user.private_used_bytes,
            }
        } else {
            NamespaceUsage {
                quota_bytes: user.public_quota_bytes,
                used_bytes: user.public_used_bytes,
            }
        }));
    }
    if let Some(org) = db::get_organization_by_name(pool, namespace).await? {
        return Ok(Some(if is_private {
            NamespaceUsage {
                quota_bytes: org.private_quota_bytes,
                used_bytes: org.private_used_bytes,
            }
        } else {
            NamespaceUsage {
                quota_bytes: org.public_quota_bytes,
                used_bytes: org.public_used_bytes,
            }
        }));
    }
    Ok(None)
}

/// Admission check run before any presigned upload URL is issued.
pub async fn check_quota(
    pool: &AnyPool,
    namespace: &str,
    additional_bytes: i64,
    is_private: bool,
) -> Result<(), HubError> {
    let Some(usage) = namespace_usage(pool, namespace, is_private).await? else {
        return Err(HubError::BadRequest(format!(
            "namespace not found: {namespace}"
        )));
    };

    let Some(quota) = usage.quota_bytes else {
        return Ok(()); // unlimited
    };

    let new_usage = usage.used_bytes + additional_bytes;
    if new_usage > quota {
        let kind = if is_private { "Private" } else { "Public" };
        return Err(HubError::QuotaExceeded(format!(
            "{kind} storage quota exceeded: {new_usage} bytes would exceed the limit of {quota} bytes"
        )));
    }

    Ok(())
}

/// Apply a signed storage delta to a namespace (clamped at zero).
pub async fn increment_storage(
    pool: &AnyPool,
    namespace: &str,
    bytes_delta: i64,
    is_private: bool,
) -> Result<(), HubError> {
    let column = if is_private {
        "private_used_bytes"
    } else {
        "public_used_bytes"
    };

    // Same statement shape for user and org tables; CASE instead of a
    // two-arg MAX(), which postgres does not have.
    let user_sql = format!(
        r#"UPDATE "user" SET {column} = CASE
             WHEN {column} + $1 < 0 THEN 0 ELSE {column} + $1 END
           WHERE name = $2"#
    );
    let updated = sqlx::query(&user_sql)
        .bind(bytes_delta)
        .bind(namespace)
        .execute(pool)
        .await?
        .rows_affected();

    if updated == 0 {
        let org_sql = format!(
            r"UPDATE organization SET {column} = CASE
                 WHEN {column} + $1 < 0 THEN 0 ELSE {column} + $1 END
               WHERE name = $2"
        );
        sqlx::query(&org_sql)
            .bind(bytes_delta)
            .bind(namespace)
            .execute(pool)
            .await?;
    }

    tracing::debug!(namespace, bytes_delta, is_private, "storage usage updated");
    Ok(())
}

/// Total bytes attributable to one repository: live objects on the main
/// branch plus every retained LFS version.
pub async fn calculate_repository_storage(
    state: &AppState,
    repo: &Repository,
) -> Result<i64, HubError> {
    let repo_type = RepoType::parse(&repo.repo_type)?;
    let lakefs_repo = crate::repo::lakefs_repo_name(repo_type, &repo.namespace, &repo.name);

    let mut branch_bytes = 0i64;
    match state
        .lakefs
        .list_all_objects(&lakefs_repo, "main", "", "")
        .await
    {
        Ok(objects) => {
            for obj in &objects {
                if obj.is_object() {
                    branch_bytes += obj.size_bytes;
                }
            }
        }
        Err(e) => {
            tracing::warn!(repo = %repo.full_id, error = %e, "branch storage scan failed");
        }
    }

    let lfs_bytes: i64 = db::list_lfs_history(&state.pool, &repo.id)
        .await?
        .iter()
        .map(|row| row.size)
        .sum();

    Ok(branch_bytes + lfs_bytes)
}

/// Recompute a namespace's usage from scratch and persist it, returning
/// `(private_bytes, public_bytes)`. Also refreshes each repo's
/// denormalized `used_bytes`.
pub async fn recalculate(state: &AppState, namespace: &str) -> Result<(i64, i64), HubError> {
    let repos = db::list_namespace_repositories(&state.pool, namespace).await?;

    let mut private_bytes = 0i64;
    let mut public_bytes = 0i64;

    for repo in &repos {
        let used = calculate_repository_storage(state, repo).await?;
        sqlx::query("UPDATE repository SET used_bytes = $1 WHERE id = $2")
            .bind(used)
            .bind(&repo.id)
            .execute(&state.pool)
            .await?;
        if repo.private {
            private_bytes += used;
        } else {
            public_bytes += used;
        }
    }

    let updated = sqlx::query(
        r#"UPDATE "user" SET private_used_bytes = $1, public_used_bytes = $2 WHERE name = $3"#,
    )
    .bind(private_bytes)
    .bind(public_bytes)
    .bind(namespace)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if updated == 0 {
        sqlx::query(
            "UPDATE organization SET private_used_bytes = $1, public_used_bytes = $2
             WHERE name = $3",
        )
        .bind(private_bytes)
        .bind(public_bytes)
        .bind(namespace)
        .execute(&state.pool)
        .await?;
    }

    tracing::info!(namespace, private_bytes, public_bytes, "storage recalculated");
    Ok((private_bytes, public_bytes))
}

/// Effective per-repo quota: the repo override, else the namespace quota
/// matching the repo's privacy.
pub async fn repo_effective_quota(
    pool: &AnyPool,
    repo: &Repository,
) -> Result<Option<i64>, HubError> {
    if repo.quota_bytes.is_some() {
        return Ok(repo.quota_bytes);
    }
    Ok(namespace_usage(pool, &repo.namespace, repo.private)
        .await?
        .and_then(|usage| usage.quota_bytes))
}

/// Storage block embedded in repo info for authenticated callers.
pub async fn repo_storage_info(
    pool: &AnyPool,
    repo: &Repository,
) -> Result<serde_json::Value, HubError> {
    let effective = repo_effective_quota(pool, repo).await?;
    let available = effective.map(|quota| (quota - repo.used_bytes).max(0));
    #[allow(clippy::cast_precision_loss)]
    let percentage = effective.filter(|&quota| quota > 0).map(|quota| {
        (repo.used_bytes as f64 / quota as f64) * 100.0
    });

    Ok(serde_json::json!({
        "quota_bytes": repo.quota_bytes,
        "used_bytes": repo.used_bytes,
        "available_bytes": available,
        "percentage_used": percentage,
        "effective_quota_bytes": effective,
        "is_inheriting": repo.quota_bytes.is_none(),
    }))
}
