use std::env;

/// Top-level service configuration, loaded once at startup from
/// `KOHAKU_HUB_*` environment variables and shared via `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub app: AppConfig,
    pub s3: S3Config,
    pub lakefs: LakeFsConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Public URL the hub advertises for itself (LFS verify hrefs, repo URLs).
    pub base_url: String,
    /// "sqlite" or "postgres".
    pub db_backend: String,
    pub database_url: String,
    /// Files at or above this size go through LFS unless a suffix rule
    /// matches first.
    pub lfs_threshold_bytes: i64,
    pub lfs_keep_versions: i64,
    /// Window W for download session dedup: bucket = floor(unix / W).
    pub download_time_bucket_seconds: i64,
    pub download_keep_sessions_days: i64,
    pub download_session_cleanup_threshold: i64,
    /// Identity stamped on synthesized Git commits.
    pub git_author_name: String,
    pub git_author_email: String,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    /// Endpoint substituted into presigned URLs handed to clients.
    pub public_endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    /// "s3v4" (default) or "s3v2" (legacy MinIO; signing still uses v4,
    /// a warning is logged at startup).
    pub signature_version: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct LakeFsConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub session_expire_hours: i64,
    pub require_email_verification: bool,
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// `None` = unlimited.
    pub default_user_private_quota_bytes: Option<i64>,
    pub default_user_public_quota_bytes: Option<i64>,
    pub default_org_private_quota_bytes: Option<i64>,
    pub default_org_public_quota_bytes: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub cache_max_size: usize,
    pub cache_ttl_seconds: u64,
}

fn var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn var_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn var_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map_or(default, |v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        })
}

fn var_opt_i64(name: &str) -> Option<i64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn load() -> Self {
        Self {
            listen: var("KOHAKU_HUB_LISTEN", "0.0.0.0:28080"),
            app: AppConfig {
                base_url: var("KOHAKU_HUB_BASE_URL", "http://localhost:28080"),
                db_backend: var("KOHAKU_HUB_DB_BACKEND", "sqlite"),
                database_url: var("KOHAKU_HUB_DATABASE_URL", "sqlite://kohakuhub.db"),
                lfs_threshold_bytes: var_i64("KOHAKU_HUB_LFS_THRESHOLD_BYTES", 10 * 1024 * 1024),
                lfs_keep_versions: var_i64("KOHAKU_HUB_LFS_KEEP_VERSIONS", 5),
                download_time_bucket_seconds: var_i64(
                    "KOHAKU_HUB_DOWNLOAD_TIME_BUCKET_SECONDS",
                    1800,
                ),
                download_keep_sessions_days: var_i64("KOHAKU_HUB_DOWNLOAD_KEEP_SESSIONS_DAYS", 30),
                download_session_cleanup_threshold: var_i64(
                    "KOHAKU_HUB_DOWNLOAD_SESSION_CLEANUP_THRESHOLD",
                    10_000,
                ),
                git_author_name: var("KOHAKU_HUB_GIT_AUTHOR_NAME", "KohakuHub"),
                git_author_email: var("KOHAKU_HUB_GIT_AUTHOR_EMAIL", "noreply@kohakuhub.local"),
            },
            s3: S3Config {
                endpoint: var("KOHAKU_HUB_S3_ENDPOINT", "http://localhost:9000"),
                public_endpoint: var("KOHAKU_HUB_S3_PUBLIC_ENDPOINT", "http://localhost:9000"),
                access_key: var("KOHAKU_HUB_S3_ACCESS_KEY", "minioadmin"),
                secret_key: var("KOHAKU_HUB_S3_SECRET_KEY", "minioadmin"),
                bucket: var("KOHAKU_HUB_S3_BUCKET", "hub-storage"),
                region: var("KOHAKU_HUB_S3_REGION", "us-east-1"),
                signature_version: var("KOHAKU_HUB_S3_SIGNATURE_VERSION", "s3v4"),
                force_path_style: var_bool("KOHAKU_HUB_S3_FORCE_PATH_STYLE", true),
            },
            lakefs: LakeFsConfig {
                endpoint: var("KOHAKU_HUB_LAKEFS_ENDPOINT", "http://localhost:8000"),
                access_key: var("KOHAKU_HUB_LAKEFS_ACCESS_KEY", ""),
                secret_key: var("KOHAKU_HUB_LAKEFS_SECRET_KEY", ""),
            },
            auth: AuthConfig {
                session_expire_hours: var_i64("KOHAKU_HUB_SESSION_EXPIRE_HOURS", 24 * 7),
                require_email_verification: var_bool(
                    "KOHAKU_HUB_REQUIRE_EMAIL_VERIFICATION",
                    false,
                ),
            },
            quota: QuotaConfig {
                default_user_private_quota_bytes: var_opt_i64(
                    "KOHAKU_HUB_DEFAULT_USER_PRIVATE_QUOTA_BYTES",
                ),
                default_user_public_quota_bytes: var_opt_i64(
                    "KOHAKU_HUB_DEFAULT_USER_PUBLIC_QUOTA_BYTES",
                ),
                default_org_private_quota_bytes: var_opt_i64(
                    "KOHAKU_HUB_DEFAULT_ORG_PRIVATE_QUOTA_BYTES",
                ),
                default_org_public_quota_bytes: var_opt_i64(
                    "KOHAKU_HUB_DEFAULT_ORG_PUBLIC_QUOTA_BYTES",
                ),
            },
            fallback: FallbackConfig {
                enabled: var_bool("KOHAKU_HUB_FALLBACK_ENABLED", false),
                cache_max_size: usize::try_from(var_i64("KOHAKU_HUB_FALLBACK_CACHE_MAX_SIZE", 1000))
                    .unwrap_or(1000),
                cache_ttl_seconds: u64::try_from(var_i64(
                    "KOHAKU_HUB_FALLBACK_CACHE_TTL_SECONDS",
                    300,
                ))
                .unwrap_or(300),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::load();
        assert!(cfg.app.lfs_threshold_bytes > 0);
        assert!(cfg.app.download_time_bucket_seconds > 0);
        assert!(cfg.fallback.cache_max_size > 0);
    }
}
