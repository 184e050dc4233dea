pub mod bootstrap;
pub mod pool;

use std::sync::Arc;

use sqlx::AnyPool;

use crate::config::Config;
use crate::fallback::cache::FallbackCache;
use crate::git::bridge::GitShaCache;
use crate::lakefs::LakeFsClient;
use crate::s3::ObjectStore;

/// Shared per-process state handed to every handler.
///
/// The fallback cache, the Git SHA mapping and the DB pool are the only
/// process-wide mutable state; everything else here is immutable config
/// or stateless clients.
#[derive(Clone)]
pub struct AppState {
    pub pool: AnyPool,
    pub s3: ObjectStore,
    pub lakefs: LakeFsClient,
    /// Outbound client for fallback peers.
    pub http: reqwest::Client,
    pub fallback_cache: Arc<FallbackCache>,
    pub git_shas: Arc<GitShaCache>,
    pub config: Arc<Config>,
}
