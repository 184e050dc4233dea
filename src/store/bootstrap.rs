use sqlx::AnyPool;

/// Idempotent schema bootstrap.
///
/// Every statement is valid for both sqlite and postgres: ids are text
/// uuids, timestamps are unix-seconds BIGINT, dates are ISO `TEXT`, and
/// unique constraints live in separate `CREATE UNIQUE INDEX` statements.
/// `"user"` and `"commit"` are quoted (reserved words on postgres).
const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS "user" (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        normalized_name TEXT NOT NULL,
        email TEXT,
        password_hash TEXT,
        email_verified BOOLEAN NOT NULL,
        is_active BOOLEAN NOT NULL,
        private_quota_bytes BIGINT,
        public_quota_bytes BIGINT,
        private_used_bytes BIGINT NOT NULL,
        public_used_bytes BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS user_name ON "user"(name)"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS user_normalized_name ON "user"(normalized_name)"#,
    r#"CREATE TABLE IF NOT EXISTS organization (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        normalized_name TEXT NOT NULL,
        description TEXT,
        private_quota_bytes BIGINT,
        public_quota_bytes BIGINT,
        private_used_bytes BIGINT NOT NULL,
        public_used_bytes BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS organization_name ON organization(name)",
    r"CREATE UNIQUE INDEX IF NOT EXISTS organization_normalized_name
        ON organization(normalized_name)",
    r#"CREATE TABLE IF NOT EXISTS userorganization (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        organization_id TEXT NOT NULL REFERENCES organization(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS userorganization_member
        ON userorganization(user_id, organization_id)",
    r#"CREATE TABLE IF NOT EXISTS session (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        user_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        expires_at BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS session_session_id ON session(session_id)",
    r#"CREATE TABLE IF NOT EXISTS token (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        token_hash TEXT NOT NULL,
        name TEXT NOT NULL,
        last_used BIGINT,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS token_hash ON token(token_hash)",
    r#"CREATE TABLE IF NOT EXISTS repository (
        id TEXT PRIMARY KEY,
        repo_type TEXT NOT NULL,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        full_id TEXT NOT NULL,
        private BOOLEAN NOT NULL,
        owner_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        quota_bytes BIGINT,
        used_bytes BIGINT NOT NULL,
        lfs_threshold_bytes BIGINT,
        lfs_keep_versions BIGINT,
        lfs_suffix_rules TEXT,
        downloads BIGINT NOT NULL,
        likes_count BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS repository_triple
        ON repository(repo_type, namespace, name)",
    r"CREATE INDEX IF NOT EXISTS repository_namespace ON repository(namespace)",
    r#"CREATE TABLE IF NOT EXISTS file (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        path_in_repo TEXT NOT NULL,
        size BIGINT NOT NULL,
        sha256 TEXT NOT NULL,
        lfs BOOLEAN NOT NULL,
        is_deleted BOOLEAN NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS file_repo_path ON file(repository_id, path_in_repo)",
    r"CREATE INDEX IF NOT EXISTS file_sha256 ON file(sha256)",
    r#"CREATE TABLE IF NOT EXISTS stagingupload (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        revision TEXT NOT NULL,
        path_in_repo TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        size BIGINT NOT NULL,
        storage_key TEXT NOT NULL,
        lfs BOOLEAN NOT NULL,
        upload_id TEXT,
        uploader_id TEXT REFERENCES "user"(id) ON DELETE SET NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS stagingupload_path
        ON stagingupload(repository_id, revision, path_in_repo)",
    r#"CREATE TABLE IF NOT EXISTS "commit" (
        id TEXT PRIMARY KEY,
        commit_id TEXT NOT NULL,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        repo_type TEXT NOT NULL,
        branch TEXT NOT NULL,
        author_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        username TEXT NOT NULL,
        message TEXT NOT NULL,
        description TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS commit_repo_sha
        ON "commit"(commit_id, repository_id)"#,
    r#"CREATE INDEX IF NOT EXISTS commit_repo_branch ON "commit"(repository_id, branch)"#,
    r#"CREATE TABLE IF NOT EXISTS lfsobjecthistory (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        path_in_repo TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        size BIGINT NOT NULL,
        commit_id TEXT NOT NULL,
        file_id TEXT REFERENCES file(id) ON DELETE SET NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE INDEX IF NOT EXISTS lfsobjecthistory_repo_path
        ON lfsobjecthistory(repository_id, path_in_repo)",
    r"CREATE INDEX IF NOT EXISTS lfsobjecthistory_sha256 ON lfsobjecthistory(sha256)",
    r#"CREATE TABLE IF NOT EXISTS repositorylike (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS repositorylike_repo_user
        ON repositorylike(repository_id, user_id)",
    r#"CREATE TABLE IF NOT EXISTS downloadsession (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        user_id TEXT REFERENCES "user"(id) ON DELETE SET NULL,
        session_id TEXT NOT NULL,
        time_bucket BIGINT NOT NULL,
        file_count BIGINT NOT NULL,
        first_file TEXT NOT NULL,
        first_download_at BIGINT NOT NULL,
        last_download_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS downloadsession_dedup
        ON downloadsession(repository_id, session_id, time_bucket)",
    r"CREATE INDEX IF NOT EXISTS downloadsession_first_at
        ON downloadsession(first_download_at)",
    r#"CREATE TABLE IF NOT EXISTS dailyrepostats (
        id TEXT PRIMARY KEY,
        repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
        date TEXT NOT NULL,
        download_sessions BIGINT NOT NULL,
        authenticated_downloads BIGINT NOT NULL,
        anonymous_downloads BIGINT NOT NULL,
        total_files BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS dailyrepostats_repo_date
        ON dailyrepostats(repository_id, date)",
    r#"CREATE TABLE IF NOT EXISTS fallbacksource (
        id TEXT PRIMARY KEY,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        base_url TEXT NOT NULL,
        token TEXT,
        priority BIGINT NOT NULL,
        source_type TEXT NOT NULL,
        enabled BOOLEAN NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE INDEX IF NOT EXISTS fallbacksource_namespace ON fallbacksource(namespace)",
    r#"CREATE TABLE IF NOT EXISTS invitation (
        id TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        action TEXT NOT NULL,
        parameters TEXT NOT NULL,
        created_by TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        expires_at BIGINT NOT NULL,
        max_usage BIGINT,
        usage_count BIGINT NOT NULL,
        used_at BIGINT,
        used_by TEXT REFERENCES "user"(id) ON DELETE SET NULL,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS invitation_token ON invitation(token)",
    r#"CREATE TABLE IF NOT EXISTS sshkey (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
        key_type TEXT NOT NULL,
        public_key TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        title TEXT NOT NULL,
        last_used BIGINT,
        created_at BIGINT NOT NULL
    )"#,
    r"CREATE UNIQUE INDEX IF NOT EXISTS sshkey_fingerprint ON sshkey(fingerprint)",
];

pub async fn run(pool: &AnyPool) -> anyhow::Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
