//! Repository naming and per-repo LFS policy.

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::db::Repository;
use crate::error::HubError;

/// The three repository kinds share no naming space with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Model,
    Dataset,
    Space,
}

impl RepoType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
            Self::Space => "space",
        }
    }

    /// Parse the singular form used in payloads ("model") .
    pub fn parse(s: &str) -> Result<Self, HubError> {
        match s {
            "model" => Ok(Self::Model),
            "dataset" => Ok(Self::Dataset),
            "space" => Ok(Self::Space),
            other => Err(HubError::InvalidRepoType(other.to_owned())),
        }
    }

    /// Parse the plural path segment ("models") used in URLs.
    pub fn parse_plural(s: &str) -> Result<Self, HubError> {
        match s {
            "models" => Ok(Self::Model),
            "datasets" => Ok(Self::Dataset),
            "spaces" => Ok(Self::Space),
            other => Err(HubError::InvalidRepoType(other.to_owned())),
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
            Self::Space => "spaces",
        }
    }
}

/// Name of the versioned-store repository backing a hub repo.
pub fn lakefs_repo_name(repo_type: RepoType, namespace: &str, name: &str) -> String {
    format!("hf-{}-{namespace}-{name}", repo_type.as_str())
        .to_lowercase()
        .replace(['_', '.'], "-")
}

/// Split a `namespace/name` repo id.
pub fn split_repo_id(repo_id: &str) -> Result<(&str, &str), HubError> {
    repo_id
        .split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| HubError::InvalidRepoId(repo_id.to_owned()))
}

/// Effective LFS policy for a repository: per-repo overrides with server
/// defaults filling the gaps.
#[derive(Debug, Clone)]
pub struct LfsPolicy {
    pub threshold_bytes: i64,
    pub keep_versions: i64,
    pub suffix_rules: Vec<String>,
}

impl LfsPolicy {
    pub fn effective(repo: &Repository, app: &AppConfig) -> Self {
        let suffix_rules = repo
            .lfs_suffix_rules
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default();

        Self {
            threshold_bytes: repo.lfs_threshold_bytes.unwrap_or(app.lfs_threshold_bytes),
            keep_versions: repo.lfs_keep_versions.unwrap_or(app.lfs_keep_versions),
            suffix_rules,
        }
    }

    /// A file is LFS iff its size reaches the threshold OR a suffix rule
    /// matches its name.
    pub fn is_lfs(&self, path: &str, size: i64) -> bool {
        if size >= self.threshold_bytes {
            return true;
        }
        self.suffix_rules.iter().any(|rule| path.ends_with(rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with(
        threshold: Option<i64>,
        keep: Option<i64>,
        rules: Option<&str>,
    ) -> Repository {
        Repository {
            id: "r1".into(),
            repo_type: "model".into(),
            namespace: "alice".into(),
            name: "m".into(),
            full_id: "alice/m".into(),
            private: false,
            owner_id: "u1".into(),
            quota_bytes: None,
            used_bytes: 0,
            lfs_threshold_bytes: threshold,
            lfs_keep_versions: keep,
            lfs_suffix_rules: rules.map(ToOwned::to_owned),
            downloads: 0,
            likes_count: 0,
            created_at: 0,
        }
    }

    fn app() -> AppConfig {
        AppConfig {
            base_url: "http://localhost".into(),
            db_backend: "sqlite".into(),
            database_url: "sqlite://:memory:".into(),
            lfs_threshold_bytes: 1024,
            lfs_keep_versions: 5,
            download_time_bucket_seconds: 1800,
            download_keep_sessions_days: 30,
            download_session_cleanup_threshold: 10_000,
            git_author_name: "KohakuHub".into(),
            git_author_email: "noreply@kohakuhub.local".into(),
        }
    }

    #[test]
    fn repo_type_parsing() {
        assert_eq!(RepoType::parse("model").unwrap(), RepoType::Model);
        assert_eq!(RepoType::parse_plural("datasets").unwrap(), RepoType::Dataset);
        assert!(RepoType::parse("models").is_err());
        assert!(RepoType::parse_plural("weights").is_err());
    }

    #[test]
    fn lakefs_name_is_lowercase_dns_safe() {
        assert_eq!(
            lakefs_repo_name(RepoType::Model, "Alice", "My_Model.v2"),
            "hf-model-alice-my-model-v2"
        );
    }

    #[test]
    fn split_repo_id_rejects_malformed() {
        assert_eq!(split_repo_id("alice/m").unwrap(), ("alice", "m"));
        assert!(split_repo_id("alice").is_err());
        assert!(split_repo_id("a/b/c").is_err());
        assert!(split_repo_id("/m").is_err());
    }

    #[test]
    fn threshold_boundary() {
        let policy = LfsPolicy::effective(&repo_with(None, None, None), &app());
        assert!(!policy.is_lfs("w.bin", 1023)); // threshold - 1 → regular
        assert!(policy.is_lfs("w.bin", 1024)); // at threshold → LFS
    }

    #[test]
    fn repo_override_wins() {
        let policy = LfsPolicy::effective(&repo_with(Some(10), Some(2), None), &app());
        assert_eq!(policy.threshold_bytes, 10);
        assert_eq!(policy.keep_versions, 2);
        assert!(policy.is_lfs("tiny.txt", 10));
    }

    #[test]
    fn suffix_rule_applies_below_threshold() {
        let policy =
            LfsPolicy::effective(&repo_with(None, None, Some(r#"[".safetensors"]"#)), &app());
        assert!(policy.is_lfs("model.safetensors", 1));
        assert!(!policy.is_lfs("model.txt", 1));
    }

    #[test]
    fn malformed_suffix_rules_fall_back_to_empty() {
        let policy = LfsPolicy::effective(&repo_with(None, None, Some("not-json")), &app());
        assert!(policy.suffix_rules.is_empty());
    }
}
