//! Fallback operations: the sequential try-chain entered on a local 404,
//! and the concurrent list aggregation for the listing endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::future::join_all;

use crate::db;
use crate::fallback::cache::{CacheKey, CachedSource};
use crate::fallback::source::{self, LIST_TIMEOUT, Source};
use crate::repo::RepoType;
use crate::store::AppState;

/// Whether fallback applies to this request: the global switch plus the
/// per-request `?fallback=` override (`false`/`0`/`no` disable it).
pub fn enabled_for_request(state: &AppState, fallback_param: Option<&str>) -> bool {
    if !state.config.fallback.enabled {
        return false;
    }
    match fallback_param {
        Some(value) => !matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no"),
        None => true,
    }
}

/// Enabled sources for a namespace (globals + scoped), with the cached
/// winner for this repo moved to the front.
async fn load_sources(state: &AppState, repo_type: RepoType, namespace: &str, name: &str) -> Vec<Source> {
    let rows = match db::enabled_fallback_sources(&state.pool, namespace).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "fallback source lookup failed");
            return Vec::new();
        }
    };
    let mut sources: Vec<Source> = rows.into_iter().map(Source::from_row).collect();

    let key = CacheKey {
        repo_type: repo_type.as_str().to_owned(),
        namespace: namespace.to_owned(),
        name: name.to_owned(),
    };
    if let Some(cached) = state.fallback_cache.get(&key)
        && let Some(index) = sources
            .iter()
            .position(|s| s.row.base_url == cached.source_url)
        && index > 0
    {
        let preferred = sources.remove(index);
        sources.insert(0, preferred);
    }

    sources
}

fn remember_winner(state: &AppState, repo_type: RepoType, namespace: &str, name: &str, source: &Source) {
    state.fallback_cache.set(
        CacheKey {
            repo_type: repo_type.as_str().to_owned(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        CachedSource {
            source_url: source.row.base_url.clone(),
            source_name: source.row.name.clone(),
            source_type: source.row.source_type.clone(),
        },
    );
}

/// Resolve fallback: HEAD each peer for the file; on 2xx/3xx answer a 302
/// to the peer's download URL with source attribution headers.
pub async fn try_resolve(
    state: &AppState,
    repo_type: RepoType,
    namespace: &str,
    name: &str,
    revision: &str,
    path: &str,
) -> Option<Response> {
    let sources = load_sources(state, repo_type, namespace, name).await;
    if sources.is_empty() {
        return None;
    }

    let local_path = format!(
        "/{}/{namespace}/{name}/resolve/{revision}/{path}",
        repo_type.plural()
    );

    for source in &sources {
        let response = match source.head(&state.http, &local_path, repo_type).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(source = %source.row.name, error = %e, "fallback HEAD failed");
                continue;
            }
        };

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            remember_winner(state, repo_type, namespace, name, source);
            tracing::info!(
                source = %source.row.name,
                repo = %format!("{namespace}/{name}"),
                "resolve served by fallback source"
            );

            let external_url = source.map_url(&local_path, repo_type);
            let mut redirect = (
                StatusCode::FOUND,
                [(axum::http::header::LOCATION, external_url)],
            )
                .into_response();
            let headers = redirect.headers_mut();
            if let Ok(value) = source.row.name.parse() {
                headers.insert("x-fallback-source", value);
            }
            if let Ok(value) = source.row.base_url.parse() {
                headers.insert("x-fallback-source-url", value);
            }
            return Some(redirect);
        }

        if !source::should_retry_status(status) {
            tracing::warn!(source = %source.row.name, %status, "fallback chain stopped");
            return None;
        }
    }

    None
}

/// Metadata fallback (`info` / `revision` / `paths-info` best effort):
/// first peer returning 200 wins; the JSON is annotated with its source.
pub async fn try_info(
    state: &AppState,
    repo_type: RepoType,
    namespace: &str,
    name: &str,
) -> Option<serde_json::Value> {
    let sources = load_sources(state, repo_type, namespace, name).await;
    let local_path = format!("/api/{}/{namespace}/{name}", repo_type.plural());

    for source in &sources {
        match source
            .get(&state.http, &local_path, repo_type, source::HEAD_TIMEOUT)
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => {
                let Ok(mut data) = response.json::<serde_json::Value>().await else {
                    continue;
                };
                if let Some(map) = data.as_object_mut() {
                    map.insert("_source".into(), source.row.name.clone().into());
                    map.insert("_source_url".into(), source.row.base_url.clone().into());
                }
                remember_winner(state, repo_type, namespace, name, source);
                return Some(data);
            }
            Ok(response) if !source::should_retry_status(response.status()) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(source = %source.row.name, error = %e, "fallback info failed");
            }
        }
    }

    None
}

/// Tree fallback: same chain, list-shaped payload.
pub async fn try_tree(
    state: &AppState,
    repo_type: RepoType,
    namespace: &str,
    name: &str,
    revision: &str,
    path: &str,
) -> Option<serde_json::Value> {
    let sources = load_sources(state, repo_type, namespace, name).await;
    let suffix = if path.is_empty() {
        String::new()
    } else {
        format!("/{path}")
    };
    let local_path = format!(
        "/api/{}/{namespace}/{name}/tree/{revision}{suffix}",
        repo_type.plural()
    );

    for source in &sources {
        match source
            .get(&state.http, &local_path, repo_type, LIST_TIMEOUT)
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => {
                if let Ok(data) = response.json::<serde_json::Value>().await {
                    remember_winner(state, repo_type, namespace, name, source);
                    return Some(data);
                }
            }
            Ok(response) if !source::should_retry_status(response.status()) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(source = %source.row.name, error = %e, "fallback tree failed");
            }
        }
    }

    None
}

/// Per-user repo listing fallback: only meaningful against kohakuhub
/// peers (the path is hub-specific), best-effort elsewhere.
pub async fn try_user_repos(state: &AppState, username: &str) -> Option<serde_json::Value> {
    let rows = db::enabled_fallback_sources(&state.pool, username).await.ok()?;
    let local_path = format!("/api/users/{username}/repos");

    for source in rows.into_iter().map(Source::from_row) {
        match source
            .get(&state.http, &local_path, RepoType::Model, LIST_TIMEOUT)
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => {
                if let Ok(data) = response.json::<serde_json::Value>().await {
                    return Some(data);
                }
            }
            Ok(response) if !source::should_retry_status(response.status()) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(source = %source.row.name, error = %e, "user repos fallback failed");
            }
        }
    }
    None
}

async fn fetch_external_list(
    state: &AppState,
    source: &Source,
    repo_type: RepoType,
    author: Option<&str>,
    limit: Option<i64>,
) -> Vec<serde_json::Value> {
    let mut local_path = format!("/api/{}", repo_type.plural());
    let mut query = Vec::new();
    if let Some(author) = author {
        query.push(format!("author={author}"));
    }
    if let Some(limit) = limit {
        query.push(format!("limit={limit}"));
    }
    if !query.is_empty() {
        local_path = format!("{local_path}?{}", query.join("&"));
    }

    let response = match source
        .get(&state.http, &local_path, repo_type, LIST_TIMEOUT)
        .await
    {
        Ok(response) if response.status() == StatusCode::OK => response,
        Ok(response) => {
            tracing::warn!(source = %source.row.name, status = %response.status(), "list fetch failed");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(source = %source.row.name, error = %e, "list fetch failed");
            return Vec::new();
        }
    };

    let Ok(serde_json::Value::Array(mut items)) = response.json::<serde_json::Value>().await else {
        return Vec::new();
    };
    for item in &mut items {
        if let Some(map) = item.as_object_mut() {
            map.insert("_source".into(), source.row.name.clone().into());
            map.insert("_source_url".into(), source.row.base_url.clone().into());
        }
    }
    items
}

/// List aggregation: always fan out to every source concurrently, tag
/// local rows, merge by `id` with local winning, and apply the caller's
/// limit after the merge (no limit → everything).
pub async fn aggregate_lists(
    state: &AppState,
    repo_type: RepoType,
    author: Option<&str>,
    limit: Option<i64>,
    mut local: Vec<serde_json::Value>,
) -> Vec<serde_json::Value> {
    for item in &mut local {
        if let Some(map) = item.as_object_mut() {
            map.insert("_source".into(), "local".into());
            map.insert(
                "_source_url".into(),
                state.config.app.base_url.clone().into(),
            );
        }
    }

    let rows = match db::enabled_fallback_sources(&state.pool, author.unwrap_or("")).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "fallback source lookup failed");
            return local;
        }
    };
    if rows.is_empty() {
        return local;
    }
    let sources: Vec<Source> = rows.into_iter().map(Source::from_row).collect();

    let fetches = sources
        .iter()
        .map(|source| fetch_external_list(state, source, repo_type, author, limit));
    let external: Vec<Vec<serde_json::Value>> = join_all(fetches).await;

    let mut seen: std::collections::HashSet<String> = local
        .iter()
        .filter_map(|item| item.get("id").and_then(|id| id.as_str()))
        .map(ToOwned::to_owned)
        .collect();

    let mut merged = local;
    for items in external {
        for item in items {
            let Some(id) = item.get("id").and_then(|id| id.as_str()) else {
                continue;
            };
            if seen.insert(id.to_owned()) {
                merged.push(item);
            }
        }
    }

    match limit {
        Some(limit) if (limit as usize) < merged.len() => {
            merged.truncate(limit.max(0) as usize);
            merged
        }
        _ => merged,
    }
}

#[cfg(test)]
mod tests {
    // enabled_for_request needs an AppState; the pure parameter logic is
    // covered through a tiny helper mirroring its match arm.
    fn param_allows(value: Option<&str>) -> bool {
        match value {
            Some(value) => !matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no"),
            None => true,
        }
    }

    #[test]
    fn fallback_param_parsing() {
        assert!(param_allows(None));
        assert!(param_allows(Some("true")));
        assert!(param_allows(Some("1")));
        assert!(!param_allows(Some("false")));
        assert!(!param_allows(Some("FALSE")));
        assert!(!param_allows(Some("0")));
        assert!(!param_allows(Some("no")));
    }
}
