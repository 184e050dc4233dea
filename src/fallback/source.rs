//! Peer source modeling: URL mapping and outbound requests, dispatched
//! by source type at call time.

use std::time::Duration;

use crate::db::FallbackSourceRow;
use crate::repo::RepoType;

/// Timeout for HEAD / metadata probes against a peer.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for potentially large list fetches.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(60);

/// Peer flavors differ only in URL shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    HuggingFace,
    KohakuHub,
}

impl SourceKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "huggingface" => Self::HuggingFace,
            _ => Self::KohakuHub,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Source {
    pub row: FallbackSourceRow,
    pub kind: SourceKind,
}

impl Source {
    pub fn from_row(row: FallbackSourceRow) -> Self {
        let kind = SourceKind::parse(&row.source_type);
        Self { row, kind }
    }

    /// Map a hub-local path to the peer's URL.
    ///
    /// HuggingFace serves model downloads at `/{ns}/{name}/resolve/…`
    /// (no `/models` prefix) while datasets and spaces keep their prefix;
    /// API paths are shared verbatim. KohakuHub peers mirror our paths.
    pub fn map_url(&self, local_path: &str, repo_type: RepoType) -> String {
        let base = self.row.base_url.trim_end_matches('/');
        let path = match self.kind {
            SourceKind::KohakuHub => local_path.to_owned(),
            SourceKind::HuggingFace => {
                if repo_type == RepoType::Model && !local_path.starts_with("/api/") {
                    local_path
                        .strip_prefix("/models")
                        .map_or_else(|| local_path.to_owned(), ToOwned::to_owned)
                } else {
                    local_path.to_owned()
                }
            }
        };
        format!("{base}{path}")
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.row.token.as_deref() {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    pub async fn head(
        &self,
        http: &reqwest::Client,
        local_path: &str,
        repo_type: RepoType,
    ) -> reqwest::Result<reqwest::Response> {
        let url = self.map_url(local_path, repo_type);
        self.apply_auth(http.head(url).timeout(HEAD_TIMEOUT))
            .send()
            .await
    }

    pub async fn get(
        &self,
        http: &reqwest::Client,
        local_path: &str,
        repo_type: RepoType,
        timeout: Duration,
    ) -> reqwest::Result<reqwest::Response> {
        let url = self.map_url(local_path, repo_type);
        self.apply_auth(http.get(url).timeout(timeout)).send().await
    }
}

/// Auth and permission failures terminate the try-chain; anything else
/// moves on to the next source.
pub fn should_retry_status(status: reqwest::StatusCode) -> bool {
    !matches!(status.as_u16(), 401 | 403)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(base_url: &str, source_type: &str) -> FallbackSourceRow {
        FallbackSourceRow {
            id: "s1".into(),
            namespace: String::new(),
            name: "peer".into(),
            base_url: base_url.into(),
            token: None,
            priority: 100,
            source_type: source_type.into(),
            enabled: true,
            created_at: 0,
        }
    }

    #[test]
    fn hf_model_resolve_drops_plural_prefix() {
        let source = Source::from_row(row("https://huggingface.co/", "huggingface"));
        assert_eq!(
            source.map_url("/models/foo/bar/resolve/main/a.bin", RepoType::Model),
            "https://huggingface.co/foo/bar/resolve/main/a.bin"
        );
    }

    #[test]
    fn hf_dataset_resolve_keeps_prefix() {
        let source = Source::from_row(row("https://huggingface.co", "huggingface"));
        assert_eq!(
            source.map_url("/datasets/foo/bar/resolve/main/a.bin", RepoType::Dataset),
            "https://huggingface.co/datasets/foo/bar/resolve/main/a.bin"
        );
    }

    #[test]
    fn hf_api_paths_pass_through() {
        let source = Source::from_row(row("https://huggingface.co", "huggingface"));
        assert_eq!(
            source.map_url("/api/models/foo/bar", RepoType::Model),
            "https://huggingface.co/api/models/foo/bar"
        );
    }

    #[test]
    fn kohakuhub_paths_are_identical() {
        let source = Source::from_row(row("https://hub.example.com", "kohakuhub"));
        assert_eq!(
            source.map_url("/models/foo/bar/resolve/main/a.bin", RepoType::Model),
            "https://hub.example.com/models/foo/bar/resolve/main/a.bin"
        );
    }

    #[test]
    fn auth_failures_stop_the_chain() {
        assert!(!should_retry_status(reqwest::StatusCode::UNAUTHORIZED));
        assert!(!should_retry_status(reqwest::StatusCode::FORBIDDEN));
        assert!(should_retry_status(reqwest::StatusCode::NOT_FOUND));
        assert!(should_retry_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn unknown_source_type_defaults_to_kohakuhub() {
        assert_eq!(SourceKind::parse("huggingface"), SourceKind::HuggingFace);
        assert_eq!(SourceKind::parse("mystery"), SourceKind::KohakuHub);
    }
}
