//! Shared glue for the HuggingFace-compatible endpoints.

use crate::db::{self, Repository};
use crate::error::HubError;
use crate::lakefs::StoreError;
use crate::repo::{RepoType, lakefs_repo_name};
use crate::store::AppState;

/// HF-style timestamps: ISO-8601 with fractional seconds, UTC.
pub fn format_hf_datetime(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

pub async fn get_repo(
    state: &AppState,
    repo_type: RepoType,
    namespace: &str,
    name: &str,
) -> Result<Repository, HubError> {
    db::get_repository(&state.pool, repo_type.as_str(), namespace, name)
        .await?
        .ok_or_else(|| HubError::RepoNotFound(format!("{namespace}/{name}")))
}

/// Store errors at a revision boundary: 404 means the revision is gone,
/// anything else is an upstream failure.
pub fn revision_err(e: &StoreError, revision: &str) -> HubError {
    if e.is_not_found() {
        HubError::RevisionNotFound(revision.to_owned())
    } else {
        HubError::UpstreamUnavailable(e.to_string())
    }
}

/// Store errors at an object boundary.
pub fn entry_err(e: &StoreError, path: &str) -> HubError {
    if e.is_not_found() {
        HubError::EntryNotFound(path.to_owned())
    } else {
        HubError::UpstreamUnavailable(e.to_string())
    }
}

/// `(commit sha, lastModified)` of a repo's branch head, both `None`
/// when the store has no commits or is unreachable.
pub async fn branch_head_info(
    state: &AppState,
    repo: &Repository,
    r#ref: &str,
) -> (Option<String>, Option<String>) {
    let Ok(repo_type) = RepoType::parse(&repo.repo_type) else {
        return (None, None);
    };
    let lakefs_repo = lakefs_repo_name(repo_type, &repo.namespace, &repo.name);

    let sha = match state.lakefs.get_branch(&lakefs_repo, r#ref).await {
        Ok(branch) if !branch.commit_id.is_empty() => branch.commit_id,
        Ok(_) => return (None, None),
        Err(e) => {
            // A branch-shaped ref that isn't a branch may be a commit id.
            if let Ok(commit) = state.lakefs.get_commit(&lakefs_repo, r#ref).await {
                let modified = Some(format_hf_datetime(commit.creation_date));
                return (Some(commit.id), modified);
            }
            tracing::debug!(repo = %repo.full_id, error = %e, "branch lookup failed");
            return (None, None);
        }
    };

    let last_modified = match state.lakefs.get_commit(&lakefs_repo, &sha).await {
        Ok(commit) => Some(format_hf_datetime(commit.creation_date)),
        Err(_) => None,
    };

    (Some(sha), last_modified)
}

/// Listing-item shape shared by `/api/{type}s` and the per-user listing.
pub async fn repo_list_item(state: &AppState, repo: &Repository) -> serde_json::Value {
    let (sha, last_modified) = branch_head_info(state, repo, "main").await;
    serde_json::json!({
        "id": repo.full_id,
        "author": repo.namespace,
        "private": repo.private,
        "sha": sha,
        "lastModified": last_modified,
        "createdAt": format_hf_datetime(repo.created_at),
        "downloads": repo.downloads,
        "likes": repo.likes_count,
        "gated": false,
        "tags": [],
    })
}

/// Privacy filter for listings: anonymous sees public; authenticated
/// also sees their own repos and those of their orgs.
pub async fn filter_visible(
    state: &AppState,
    repos: Vec<Repository>,
    user: Option<&db::User>,
) -> Result<Vec<Repository>, HubError> {
    let Some(user) = user else {
        return Ok(repos.into_iter().filter(|r| !r.private).collect());
    };

    let org_names = db::list_user_org_names(&state.pool, &user.id).await?;
    Ok(repos
        .into_iter()
        .filter(|repo| {
            !repo.private || repo.namespace == user.name || org_names.contains(&repo.namespace)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hf_datetime_shape() {
        let formatted = format_hf_datetime(1_700_000_000);
        assert!(formatted.starts_with("2023-11-14T"));
        assert!(formatted.ends_with('Z'));
        assert!(formatted.contains('.'));
    }
}
