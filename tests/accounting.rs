//! Integration tests for the DB-backed subsystems (quota admission,
//! download accounting, permissions) against a real sqlite database.
//! No object store or versioned store is contacted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use kohakuhub::auth::permissions;
use kohakuhub::config::Config;
use kohakuhub::db;
use kohakuhub::downloads;
use kohakuhub::error::HubError;
use kohakuhub::fallback::cache::FallbackCache;
use kohakuhub::git::bridge::GitShaCache;
use kohakuhub::lakefs::LakeFsClient;
use kohakuhub::quota;
use kohakuhub::s3::ObjectStore;
use kohakuhub::store::{AppState, pool};

struct TestHub {
    state: AppState,
    // Keeps the sqlite file alive for the test's duration.
    _dir: tempfile::TempDir,
}

async fn test_hub() -> TestHub {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("hub.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());

    let pool = pool::connect("sqlite", &url).await.expect("pool");

    let cfg = Config::load();
    let state = AppState {
        pool,
        s3: ObjectStore::new(&cfg.s3).expect("object store"),
        lakefs: LakeFsClient::new("http://127.0.0.1:9", "", ""),
        http: reqwest::Client::new(),
        fallback_cache: Arc::new(FallbackCache::new(16, Duration::from_secs(60))),
        git_shas: Arc::new(GitShaCache::default()),
        config: Arc::new(cfg),
    };

    TestHub { state, _dir: dir }
}

async fn insert_user(
    state: &AppState,
    name: &str,
    public_quota: Option<i64>,
    public_used: i64,
) -> String {
    let id = db::new_id();
    sqlx::query(
        r#"INSERT INTO "user"
           (id, name, normalized_name, email, password_hash, email_verified, is_active,
            private_quota_bytes, public_quota_bytes, private_used_bytes, public_used_bytes,
            created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
    )
    .bind(&id)
    .bind(name)
    .bind(db::normalize_name(name))
    .bind(format!("{name}@example.com"))
    .bind("$argon2$test")
    .bind(true)
    .bind(true)
    .bind(None::<i64>)
    .bind(public_quota)
    .bind(0i64)
    .bind(public_used)
    .bind(db::now_unix())
    .execute(&state.pool)
    .await
    .expect("insert user");
    id
}

async fn insert_repo(state: &AppState, namespace: &str, name: &str, owner_id: &str) -> String {
    let id = db::new_id();
    sqlx::query(
        "INSERT INTO repository
         (id, repo_type, namespace, name, full_id, private, owner_id, quota_bytes, used_bytes,
          lfs_threshold_bytes, lfs_keep_versions, lfs_suffix_rules, downloads, likes_count,
          created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(&id)
    .bind("model")
    .bind(namespace)
    .bind(name)
    .bind(format!("{namespace}/{name}"))
    .bind(false)
    .bind(owner_id)
    .bind(None::<i64>)
    .bind(0i64)
    .bind(None::<i64>)
    .bind(None::<i64>)
    .bind(None::<String>)
    .bind(0i64)
    .bind(0i64)
    .bind(db::now_unix())
    .execute(&state.pool)
    .await
    .expect("insert repo");
    id
}

#[tokio::test]
async fn quota_rejection_reports_both_numbers() {
    let hub = test_hub().await;
    insert_user(&hub.state, "alice", Some(100), 90).await;

    let err = quota::check_quota(&hub.state.pool, "alice", 20, false)
        .await
        .expect_err("over quota");
    match err {
        HubError::QuotaExceeded(message) => {
            assert!(message.contains("110"), "message: {message}");
            assert!(message.contains("100"), "message: {message}");
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }

    // Within limit passes.
    quota::check_quota(&hub.state.pool, "alice", 10, false)
        .await
        .expect("within quota");
}

#[tokio::test]
async fn null_quota_is_unlimited() {
    let hub = test_hub().await;
    insert_user(&hub.state, "bob", None, 0).await;

    quota::check_quota(&hub.state.pool, "bob", i64::MAX / 2, false)
        .await
        .expect("unlimited");
}

#[tokio::test]
async fn storage_deltas_clamp_at_zero() {
    let hub = test_hub().await;
    insert_user(&hub.state, "carol", Some(1000), 10).await;

    quota::increment_storage(&hub.state.pool, "carol", -100, false)
        .await
        .expect("decrement");
    let user = db::get_user_by_name(&hub.state.pool, "carol")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.public_used_bytes, 0);
}

#[tokio::test]
async fn downloads_dedup_within_one_time_bucket() {
    let hub = test_hub().await;
    let owner = insert_user(&hub.state, "alice", None, 0).await;
    let repo_id = insert_repo(&hub.state, "alice", "m", &owner).await;

    // Two fetches, same session cookie, same bucket.
    for _ in 0..2 {
        downloads::track_download(&hub.state, &repo_id, "a.bin", "cookie-1", None)
            .await
            .expect("track");
    }

    let sessions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM downloadsession WHERE repository_id = $1")
            .bind(&repo_id)
            .fetch_one(&hub.state.pool)
            .await
            .unwrap();
    assert_eq!(sessions, 1);

    let file_count: i64 =
        sqlx::query_scalar("SELECT file_count FROM downloadsession WHERE repository_id = $1")
            .bind(&repo_id)
            .fetch_one(&hub.state.pool)
            .await
            .unwrap();
    assert_eq!(file_count, 2);

    let (download_sessions, total_files): (i64, i64) = sqlx::query_as(
        "SELECT download_sessions, total_files FROM dailyrepostats WHERE repository_id = $1",
    )
    .bind(&repo_id)
    .fetch_one(&hub.state.pool)
    .await
    .unwrap();
    assert_eq!(download_sessions, 1);
    assert_eq!(total_files, 2);

    let downloads_counter: i64 =
        sqlx::query_scalar("SELECT downloads FROM repository WHERE id = $1")
            .bind(&repo_id)
            .fetch_one(&hub.state.pool)
            .await
            .unwrap();
    assert_eq!(downloads_counter, 1);
}

#[tokio::test]
async fn distinct_sessions_count_separately() {
    let hub = test_hub().await;
    let owner = insert_user(&hub.state, "alice", None, 0).await;
    let repo_id = insert_repo(&hub.state, "alice", "m", &owner).await;

    downloads::track_download(&hub.state, &repo_id, "a.bin", "cookie-1", None)
        .await
        .unwrap();
    downloads::track_download(&hub.state, &repo_id, "a.bin", "cookie-2", Some(owner.clone()))
        .await
        .unwrap();

    let (sessions, auth, anon): (i64, i64, i64) = sqlx::query_as(
        "SELECT download_sessions, authenticated_downloads, anonymous_downloads
         FROM dailyrepostats WHERE repository_id = $1",
    )
    .bind(&repo_id)
    .fetch_one(&hub.state.pool)
    .await
    .unwrap();
    assert_eq!(sessions, 2);
    assert_eq!(auth, 1);
    assert_eq!(anon, 1);
}

#[tokio::test]
async fn rollup_aggregates_history_by_day() {
    let hub = test_hub().await;
    let owner = insert_user(&hub.state, "alice", None, 0).await;
    let repo_id = insert_repo(&hub.state, "alice", "m", &owner).await;

    // Two sessions three days ago, one two days ago, inserted directly
    // as the accounting path would have left them.
    let three_days = (Utc::now() - TimeDelta::days(3)).timestamp();
    let two_days = (Utc::now() - TimeDelta::days(2)).timestamp();
    for (at, session, files) in [
        (three_days, "s1", 3i64),
        (three_days + 60, "s2", 1),
        (two_days, "s3", 2),
    ] {
        sqlx::query(
            "INSERT INTO downloadsession
             (id, repository_id, user_id, session_id, time_bucket, file_count, first_file,
              first_download_at, last_download_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(db::new_id())
        .bind(&repo_id)
        .bind(None::<String>)
        .bind(session)
        .bind(at / 1800)
        .bind(files)
        .bind("a.bin")
        .bind(at)
        .bind(at)
        .execute(&hub.state.pool)
        .await
        .unwrap();
    }

    downloads::ensure_stats_up_to_date(&hub.state.pool, &repo_id)
        .await
        .expect("rollup");

    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT date, download_sessions, total_files FROM dailyrepostats
         WHERE repository_id = $1 ORDER BY date ASC",
    )
    .bind(&repo_id)
    .fetch_all(&hub.state.pool)
    .await
    .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].1, rows[0].2), (2, 4));
    assert_eq!((rows[1].1, rows[1].2), (1, 2));
}

#[tokio::test]
async fn org_membership_gates_write_access() {
    let hub = test_hub().await;
    let member = insert_user(&hub.state, "dev", None, 0).await;
    let visitor = insert_user(&hub.state, "guest", None, 0).await;

    let org_id = db::new_id();
    sqlx::query(
        "INSERT INTO organization
         (id, name, normalized_name, description, private_quota_bytes, public_quota_bytes,
          private_used_bytes, public_used_bytes, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&org_id)
    .bind("acme")
    .bind("acme")
    .bind(None::<String>)
    .bind(None::<i64>)
    .bind(None::<i64>)
    .bind(0i64)
    .bind(0i64)
    .bind(db::now_unix())
    .execute(&hub.state.pool)
    .await
    .unwrap();

    for (user_id, role) in [(&member, "member"), (&visitor, "visitor")] {
        sqlx::query(
            "INSERT INTO userorganization (id, user_id, organization_id, role, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(db::new_id())
        .bind(user_id)
        .bind(&org_id)
        .bind(role)
        .bind(db::now_unix())
        .execute(&hub.state.pool)
        .await
        .unwrap();
    }

    let repo_id = insert_repo(&hub.state, "acme", "shared", &member).await;
    sqlx::query("UPDATE repository SET private = $1 WHERE id = $2")
        .bind(true)
        .bind(&repo_id)
        .execute(&hub.state.pool)
        .await
        .unwrap();
    let repo = db::get_repository(&hub.state.pool, "model", "acme", "shared")
        .await
        .unwrap()
        .unwrap();

    let member_user = db::get_user_by_name(&hub.state.pool, "dev").await.unwrap().unwrap();
    let visitor_user = db::get_user_by_name(&hub.state.pool, "guest")
        .await
        .unwrap()
        .unwrap();

    // Both can read the private repo (any membership suffices).
    permissions::check_repo_read(&hub.state.pool, &repo, Some(&member_user))
        .await
        .expect("member reads");
    permissions::check_repo_read(&hub.state.pool, &repo, Some(&visitor_user))
        .await
        .expect("visitor reads");
    assert!(matches!(
        permissions::check_repo_read(&hub.state.pool, &repo, None).await,
        Err(HubError::Unauthorized)
    ));

    // Only writing roles may write; only admins may delete.
    permissions::check_repo_write(&hub.state.pool, &repo, &member_user)
        .await
        .expect("member writes");
    assert!(matches!(
        permissions::check_repo_write(&hub.state.pool, &repo, &visitor_user).await,
        Err(HubError::Forbidden)
    ));
    assert!(matches!(
        permissions::check_repo_delete(&hub.state.pool, &repo, &member_user).await,
        Err(HubError::Forbidden)
    ));
}

#[tokio::test]
async fn fallback_sources_order_by_priority_with_scope() {
    let hub = test_hub().await;

    for (name, namespace, priority, enabled) in [
        ("global-low", "", 200i64, true),
        ("global-high", "", 50, true),
        ("scoped", "alice", 100, true),
        ("disabled", "", 1, false),
        ("other-scope", "bob", 10, true),
    ] {
        sqlx::query(
            "INSERT INTO fallbacksource
             (id, namespace, name, base_url, token, priority, source_type, enabled, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(db::new_id())
        .bind(namespace)
        .bind(name)
        .bind(format!("https://{name}.example.com"))
        .bind(None::<String>)
        .bind(priority)
        .bind("kohakuhub")
        .bind(enabled)
        .bind(db::now_unix())
        .execute(&hub.state.pool)
        .await
        .unwrap();
    }

    let sources = db::enabled_fallback_sources(&hub.state.pool, "alice")
        .await
        .unwrap();
    let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["global-high", "scoped", "global-low"]);
}
