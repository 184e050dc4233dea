//! Client for the external commit-oriented object store (LakeFS-shaped
//! REST API). The core treats this service as a collaborator with a fixed
//! contract: it never trusts it for authorship or quota enforcement.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Error from the versioned store. Carries the upstream HTTP status so
/// callers can ask `is_not_found()` instead of matching error types.
#[derive(Debug, thiserror::Error)]
#[error("versioned store error ({status:?}): {message}")]
pub struct StoreError {
    pub status: Option<u16>,
    pub message: String,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    fn transport(err: &reqwest::Error) -> Self {
        Self {
            status: None,
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStats {
    pub path: String,
    #[serde(default)]
    pub path_type: String,
    #[serde(default)]
    pub physical_address: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ObjectStats {
    pub fn is_object(&self) -> bool {
        self.path_type == "object"
    }

    pub fn is_common_prefix(&self) -> bool {
        self.path_type == "common_prefix"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_offset: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList {
    pub results: Vec<ObjectStats>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchRef {
    pub id: String,
    pub commit_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub committer: String,
    #[serde(default)]
    pub message: String,
    /// Unix seconds.
    #[serde(default)]
    pub creation_date: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitList {
    pub results: Vec<CommitRecord>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: String,
    #[serde(default)]
    pub path_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffList {
    pub results: Vec<DiffEntry>,
    #[serde(default)]
    pub pagination: Pagination,
}

/// Metadata attached when linking an externally uploaded blob at a path
/// without copying its bytes.
#[derive(Debug, Clone, Serialize)]
pub struct StagingMetadata {
    pub physical_address: String,
    pub checksum: String,
    pub size_bytes: i64,
}

#[derive(Clone)]
pub struct LakeFsClient {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
    secret_key: String,
}

impl LakeFsClient {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: format!("{}/api/v1", endpoint.trim_end_matches('/')),
            access_key: access_key.to_owned(),
            secret_key: secret_key.to_owned(),
        }
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .basic_auth(&self.access_key, Some(&self.secret_key))
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .basic_auth(&self.access_key, Some(&self.secret_key))
    }

    async fn check(response: reqwest::Response) -> StoreResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError {
            status: Some(status.as_u16()),
            message,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> StoreResult<T> {
        Self::check(response)
            .await?
            .json::<T>()
            .await
            .map_err(|e| StoreError::transport(&e))
    }

    // -- repositories --

    pub async fn create_repo(
        &self,
        name: &str,
        storage_namespace: &str,
        default_branch: &str,
    ) -> StoreResult<()> {
        let response = self
            .post(format!("{}/repositories", self.base_url))
            .json(&json!({
                "name": name,
                "storage_namespace": storage_namespace,
                "default_branch": default_branch,
            }))
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_repo(&self, name: &str, force: bool) -> StoreResult<()> {
        let response = self
            .http
            .delete(format!("{}/repositories/{name}", self.base_url))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .query(&[("force", force)])
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    // -- branches --

    pub async fn get_branch(&self, repo: &str, branch: &str) -> StoreResult<BranchRef> {
        let response = self
            .get(format!(
                "{}/repositories/{repo}/branches/{branch}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    pub async fn create_branch(&self, repo: &str, name: &str, source: &str) -> StoreResult<()> {
        let response = self
            .post(format!("{}/repositories/{repo}/branches", self.base_url))
            .json(&json!({"name": name, "source": source}))
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &str, branch: &str) -> StoreResult<()> {
        let response = self
            .http
            .delete(format!(
                "{}/repositories/{repo}/branches/{branch}",
                self.base_url
            ))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    // -- objects --

    pub async fn stat_object(&self, repo: &str, r#ref: &str, path: &str) -> StoreResult<ObjectStats> {
        let response = self
            .get(format!(
                "{}/repositories/{repo}/refs/{}/objects/stat",
                self.base_url, r#ref
            ))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    pub async fn list_objects(
        &self,
        repo: &str,
        r#ref: &str,
        prefix: &str,
        delimiter: &str,
        amount: i64,
        after: &str,
    ) -> StoreResult<ObjectList> {
        let amount = amount.to_string();
        let mut query = vec![("prefix", prefix), ("amount", &amount), ("after", after)];
        if !delimiter.is_empty() {
            query.push(("delimiter", delimiter));
        }
        let response = self
            .get(format!(
                "{}/repositories/{repo}/refs/{}/objects/ls",
                self.base_url, r#ref
            ))
            .query(&query)
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    /// Exhaust pagination and return every object under a prefix.
    pub async fn list_all_objects(
        &self,
        repo: &str,
        r#ref: &str,
        prefix: &str,
        delimiter: &str,
    ) -> StoreResult<Vec<ObjectStats>> {
        let mut all = Vec::new();
        let mut after = String::new();
        loop {
            let page = self
                .list_objects(repo, r#ref, prefix, delimiter, 1000, &after)
                .await?;
            all.extend(page.results);
            if page.pagination.has_more {
                after = page.pagination.next_offset;
            } else {
                return Ok(all);
            }
        }
    }

    pub async fn get_object(&self, repo: &str, r#ref: &str, path: &str) -> StoreResult<Vec<u8>> {
        let response = self
            .get(format!(
                "{}/repositories/{repo}/refs/{}/objects",
                self.base_url, r#ref
            ))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        let response = Self::check(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Ok(bytes.to_vec())
    }

    pub async fn upload_object(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: Vec<u8>,
    ) -> StoreResult<ObjectStats> {
        let response = self
            .post(format!(
                "{}/repositories/{repo}/branches/{branch}/objects",
                self.base_url
            ))
            .query(&[("path", path), ("force", "true")])
            .header("content-type", "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    pub async fn delete_object(&self, repo: &str, branch: &str, path: &str) -> StoreResult<()> {
        let response = self
            .http
            .delete(format!(
                "{}/repositories/{repo}/branches/{branch}/objects",
                self.base_url
            ))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Attach an externally-uploaded blob to a logical path without
    /// copying bytes (LFS promotion).
    pub async fn link_physical_address(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        metadata: &StagingMetadata,
    ) -> StoreResult<ObjectStats> {
        let response = self
            .http
            .put(format!(
                "{}/repositories/{repo}/branches/{branch}/staging/backing",
                self.base_url
            ))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .query(&[("path", path)])
            .json(metadata)
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    // -- commits --

    pub async fn commit(
        &self,
        repo: &str,
        branch: &str,
        message: &str,
        metadata: Option<&serde_json::Value>,
    ) -> StoreResult<CommitRecord> {
        let mut body = json!({"message": message});
        if let Some(metadata) = metadata {
            body["metadata"] = metadata.clone();
        }
        let response = self
            .post(format!(
                "{}/repositories/{repo}/branches/{branch}/commits",
                self.base_url
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    pub async fn get_commit(&self, repo: &str, commit_id: &str) -> StoreResult<CommitRecord> {
        let response = self
            .get(format!(
                "{}/repositories/{repo}/commits/{commit_id}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    pub async fn log_commits(
        &self,
        repo: &str,
        r#ref: &str,
        amount: i64,
        after: &str,
    ) -> StoreResult<CommitList> {
        let amount = amount.to_string();
        let response = self
            .get(format!(
                "{}/repositories/{repo}/refs/{}/commits",
                self.base_url, r#ref
            ))
            .query(&[("amount", amount.as_str()), ("after", after)])
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }

    pub async fn diff_refs(
        &self,
        repo: &str,
        left_ref: &str,
        right_ref: &str,
    ) -> StoreResult<DiffList> {
        let response = self
            .get(format!(
                "{}/repositories/{repo}/refs/{left_ref}/diff/{right_ref}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| StoreError::transport(&e))?;
        Self::json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        let err = StoreError {
            status: Some(404),
            message: "no such object".into(),
        };
        assert!(err.is_not_found());

        let err = StoreError {
            status: Some(500),
            message: "boom".into(),
        };
        assert!(!err.is_not_found());

        let err = StoreError {
            status: None,
            message: "connection refused".into(),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn object_stats_path_types() {
        let stats: ObjectStats = serde_json::from_value(serde_json::json!({
            "path": "dir/",
            "path_type": "common_prefix",
        }))
        .unwrap();
        assert!(stats.is_common_prefix());
        assert!(!stats.is_object());
    }

    #[test]
    fn commit_record_parses_store_shape() {
        let commit: CommitRecord = serde_json::from_value(serde_json::json!({
            "id": "abc123",
            "parents": ["def456"],
            "committer": "store",
            "message": "update weights",
            "creation_date": 1_700_000_000,
            "meta_range_id": "ignored",
        }))
        .unwrap();
        assert_eq!(commit.id, "abc123");
        assert_eq!(commit.parents, vec!["def456"]);
        assert_eq!(commit.creation_date, 1_700_000_000);
    }
}
