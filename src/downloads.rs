//! Download accounting: session-deduplicated counters with a real-time
//! "today" row and lazy rollup of history.
//!
//! Accounting runs as a detached task after the download response is
//! already on its way; failures are logged and never fail the download.

use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{NaiveDate, TimeDelta, Utc};
use sqlx::AnyPool;

use crate::db::{self, DownloadSessionRow};
use crate::store::AppState;

/// Anonymous tracking cookie name.
pub const TRACKING_COOKIE: &str = "hf_download_session";

/// Accounting must not hold resources past this budget.
const ACCOUNTING_DEADLINE: Duration = Duration::from_secs(5);

/// `floor(unix / W)`: coalesces repeated fetches into one session.
pub fn time_bucket(unix_now: i64, window_seconds: i64) -> i64 {
    unix_now / window_seconds.max(1)
}

/// Session id for dedup: the auth session cookie when present, else the
/// anonymous tracking cookie. Returns `(session_id, set_cookie)` where
/// `set_cookie` is a header value to attach when a fresh tracking cookie
/// was minted.
pub fn resolve_session_id(headers: &HeaderMap, authenticated: bool) -> (String, Option<String>) {
    if authenticated
        && let Some(session) = crate::auth::middleware::extract_cookie(headers, "session")
    {
        return (session, None);
    }
    if let Some(existing) = crate::auth::middleware::extract_cookie(headers, TRACKING_COOKIE) {
        return (existing, None);
    }

    let fresh = uuid::Uuid::new_v4().simple().to_string();
    let cookie = format!("{TRACKING_COOKIE}={fresh}; Max-Age=86400; HttpOnly; SameSite=Lax; Path=/");
    (fresh, Some(cookie))
}

/// Fire-and-forget entry point called from the resolve handler.
pub fn spawn_track_download(
    state: &AppState,
    repository_id: String,
    file_path: String,
    session_id: String,
    user_id: Option<String>,
) {
    let state = state.clone();
    tokio::spawn(async move {
        let tracked = tokio::time::timeout(
            ACCOUNTING_DEADLINE,
            track_download(&state, &repository_id, &file_path, &session_id, user_id),
        )
        .await;
        match tracked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(repository_id, error = %e, "download tracking failed"),
            Err(_) => tracing::warn!(repository_id, "download tracking timed out"),
        }
    });
}

async fn get_download_session(
    pool: &AnyPool,
    repository_id: &str,
    session_id: &str,
    bucket: i64,
) -> sqlx::Result<Option<DownloadSessionRow>> {
    sqlx::query_as::<_, DownloadSessionRow>(
        "SELECT * FROM downloadsession
         WHERE repository_id = $1 AND session_id = $2 AND time_bucket = $3",
    )
    .bind(repository_id)
    .bind(session_id)
    .bind(bucket)
    .fetch_optional(pool)
    .await
}

/// One accounting step: bump the bucketed session row or create it, with
/// all the counters that ride along.
pub async fn track_download(
    state: &AppState,
    repository_id: &str,
    file_path: &str,
    session_id: &str,
    user_id: Option<String>,
) -> anyhow::Result<()> {
    let now = db::now_unix();
    let bucket = time_bucket(now, state.config.app.download_time_bucket_seconds);
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();

    if let Some(existing) =
        get_download_session(&state.pool, repository_id, session_id, bucket).await?
    {
        bump_existing_session(&state.pool, &existing.id, repository_id, &today, now).await?;
        return Ok(());
    }

    match insert_new_session(
        state,
        repository_id,
        file_path,
        session_id,
        bucket,
        user_id.as_deref(),
        &today,
        now,
    )
    .await
    {
        Ok(()) => {}
        Err(e) if is_unique_violation(&e) => {
            // Lost the race against a concurrent request in the same
            // bucket: fold into the row the winner inserted.
            let existing = get_download_session(&state.pool, repository_id, session_id, bucket)
                .await?
                .ok_or_else(|| anyhow::anyhow!("session row vanished after conflict"))?;
            bump_existing_session(&state.pool, &existing.id, repository_id, &today, now).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let session_count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM downloadsession WHERE repository_id = $1")
            .bind(repository_id)
            .fetch_one(&state.pool)
            .await?;

    if session_count > state.config.app.download_session_cleanup_threshold {
        let state = state.clone();
        let repository_id = repository_id.to_owned();
        tokio::spawn(async move {
            if let Err(e) = aggregate_old_sessions(&state, &repository_id).await {
                tracing::warn!(repository_id, error = %e, "session rollup failed");
            }
        });
    }

    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err)
        if matches!(db_err.code().as_deref(), Some("23505" | "1555" | "2067")))
}

async fn bump_existing_session(
    pool: &AnyPool,
    row_id: &str,
    repository_id: &str,
    today: &str,
    now: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE downloadsession
         SET file_count = file_count + 1, last_download_at = $1
         WHERE id = $2",
    )
    .bind(now)
    .bind(row_id)
    .execute(pool)
    .await?;

    sqlx::query(
        "UPDATE dailyrepostats SET total_files = total_files + 1
         WHERE repository_id = $1 AND date = $2",
    )
    .bind(repository_id)
    .bind(today)
    .execute(pool)
    .await?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_new_session(
    state: &AppState,
    repository_id: &str,
    file_path: &str,
    session_id: &str,
    bucket: i64,
    user_id: Option<&str>,
    today: &str,
    now: i64,
) -> sqlx::Result<()> {
    let authenticated = i64::from(user_id.is_some());
    let mut tx = state.pool.begin().await?;

    sqlx::query(
        "INSERT INTO downloadsession
         (id, repository_id, user_id, session_id, time_bucket, file_count, first_file,
          first_download_at, last_download_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(db::new_id())
    .bind(repository_id)
    .bind(user_id)
    .bind(session_id)
    .bind(bucket)
    .bind(1i64)
    .bind(file_path)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE repository SET downloads = downloads + 1 WHERE id = $1")
        .bind(repository_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO dailyrepostats
         (id, repository_id, date, download_sessions, authenticated_downloads,
          anonymous_downloads, total_files)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (repository_id, date) DO UPDATE SET
           download_sessions = dailyrepostats.download_sessions + 1,
           authenticated_downloads = dailyrepostats.authenticated_downloads + $5,
           anonymous_downloads = dailyrepostats.anonymous_downloads + $6,
           total_files = dailyrepostats.total_files + 1",
    )
    .bind(db::new_id())
    .bind(repository_id)
    .bind(today)
    .bind(1i64)
    .bind(authenticated)
    .bind(1 - authenticated)
    .bind(1i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

// ---------------------------------------------------------------------------
// Rollup
// ---------------------------------------------------------------------------

/// Aggregate history through yesterday, then drop sessions older than the
/// retention window.
pub async fn aggregate_old_sessions(state: &AppState, repository_id: &str) -> anyhow::Result<()> {
    ensure_stats_up_to_date(&state.pool, repository_id).await?;

    let cutoff = db::now_unix() - state.config.app.download_keep_sessions_days * 86_400;
    let deleted = sqlx::query(
        "DELETE FROM downloadsession WHERE repository_id = $1 AND first_download_at < $2",
    )
    .bind(repository_id)
    .bind(cutoff)
    .execute(&state.pool)
    .await?
    .rows_affected();

    if deleted > 0 {
        tracing::info!(repository_id, deleted, "old download sessions removed");
    }
    Ok(())
}

/// "Today" is maintained in real time; this backfills every earlier date
/// that is missing a `dailyrepostats` row.
pub async fn ensure_stats_up_to_date(pool: &AnyPool, repository_id: &str) -> anyhow::Result<()> {
    let yesterday = Utc::now().date_naive() - TimeDelta::days(1);

    let latest: Option<String> = sqlx::query_scalar(
        "SELECT date FROM dailyrepostats WHERE repository_id = $1 ORDER BY date DESC",
    )
    .bind(repository_id)
    .fetch_optional(pool)
    .await?;

    let start = match latest
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    {
        // Up to date through yesterday already.
        Some(latest) if latest >= yesterday => return Ok(()),
        Some(latest) => Some(latest + TimeDelta::days(1)),
        None => None,
    };

    aggregate_sessions_to_daily(pool, repository_id, start, yesterday).await
}

/// Aggregate sessions grouped by UTC day of `first_download_at` into
/// daily rows (replacing any partial row for those days).
pub async fn aggregate_sessions_to_daily(
    pool: &AnyPool,
    repository_id: &str,
    start: Option<NaiveDate>,
    end: NaiveDate,
) -> anyhow::Result<()> {
    let start_unix = start
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(i64::MIN, |dt| dt.and_utc().timestamp());
    let end_unix = end
        .and_hms_opt(23, 59, 59)
        .map_or(i64::MAX, |dt| dt.and_utc().timestamp());

    let sessions = sqlx::query_as::<_, DownloadSessionRow>(
        "SELECT * FROM downloadsession
         WHERE repository_id = $1 AND first_download_at >= $2 AND first_download_at <= $3
         ORDER BY first_download_at ASC",
    )
    .bind(repository_id)
    .bind(start_unix)
    .bind(end_unix)
    .fetch_all(pool)
    .await?;

    if sessions.is_empty() {
        return Ok(());
    }

    #[derive(Default)]
    struct DayTotals {
        sessions: i64,
        auth: i64,
        anon: i64,
        files: i64,
    }

    let mut daily: std::collections::BTreeMap<String, DayTotals> = std::collections::BTreeMap::new();
    for session in &sessions {
        let day = chrono::DateTime::from_timestamp(session.first_download_at, 0)
            .unwrap_or_default()
            .date_naive()
            .format("%Y-%m-%d")
            .to_string();
        let totals = daily.entry(day).or_default();
        totals.sessions += 1;
        totals.files += session.file_count;
        if session.user_id.is_some() {
            totals.auth += 1;
        } else {
            totals.anon += 1;
        }
    }

    let mut tx = pool.begin().await?;
    for (day, totals) in &daily {
        sqlx::query(
            "INSERT INTO dailyrepostats
             (id, repository_id, date, download_sessions, authenticated_downloads,
              anonymous_downloads, total_files)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (repository_id, date) DO UPDATE SET
               download_sessions = $4,
               authenticated_downloads = $5,
               anonymous_downloads = $6,
               total_files = $7",
        )
        .bind(db::new_id())
        .bind(repository_id)
        .bind(day)
        .bind(totals.sessions)
        .bind(totals.auth)
        .bind(totals.anon)
        .bind(totals.files)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(
        repository_id,
        sessions = sessions.len(),
        days = daily.len(),
        "sessions aggregated into daily stats"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 1800, 0)]
    #[case(1799, 1800, 0)]
    #[case(1800, 1800, 1)]
    #[case(3600, 1800, 2)]
    #[case(100, 0, 100)] // zero window degrades to a 1s bucket
    fn bucket_floors_by_window(#[case] now: i64, #[case] window: i64, #[case] expected: i64) {
        assert_eq!(time_bucket(now, window), expected);
    }

    #[test]
    fn anonymous_gets_fresh_tracking_cookie() {
        let headers = HeaderMap::new();
        let (session_id, cookie) = resolve_session_id(&headers, false);
        assert_eq!(session_id.len(), 32);
        let cookie = cookie.unwrap();
        assert!(cookie.starts_with("hf_download_session="));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
    }

    #[test]
    fn existing_tracking_cookie_is_reused() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "hf_download_session=abc123".parse().unwrap());
        let (session_id, cookie) = resolve_session_id(&headers, false);
        assert_eq!(session_id, "abc123");
        assert!(cookie.is_none());
    }

    #[test]
    fn auth_session_cookie_wins_when_authenticated() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            "session=sess1; hf_download_session=anon1".parse().unwrap(),
        );
        let (session_id, _) = resolve_session_id(&headers, true);
        assert_eq!(session_id, "sess1");

        let (session_id, _) = resolve_session_id(&headers, false);
        assert_eq!(session_id, "anon1");
    }
}
