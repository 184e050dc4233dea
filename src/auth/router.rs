use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::auth::token;
use crate::db;
use crate::error::HubError;
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/auth/tokens", get(list_tokens).post(create_token))
        .route("/api/auth/tokens/{token_id}", axum::routing::delete(delete_token))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    name: String,
}

fn validate_name(name: &str) -> Result<(), HubError> {
    let ok = !name.is_empty()
        && name.len() <= 96
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(HubError::BadRequest(format!("invalid name: {name}")))
    }
}

/// Argon2 hash of a new password, salted per call.
fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))
}

fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| anyhow::anyhow!("stored password hash is malformed: {e}"))?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

#[tracing::instrument(skip(state, body), fields(username = %body.username), err)]
async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, HubError> {
    validate_name(&body.username)?;

    let normalized = db::normalize_name(&body.username);
    let taken = sqlx::query_scalar::<_, i64>(
        r#"SELECT COUNT(*) FROM "user" WHERE normalized_name = $1"#,
    )
    .bind(&normalized)
    .fetch_one(&state.pool)
    .await?
        + sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM organization WHERE normalized_name = $1",
        )
        .bind(&normalized)
        .fetch_one(&state.pool)
        .await?;
    if taken > 0 {
        return Err(HubError::BadRequest(format!(
            "name '{}' is already taken",
            body.username
        )));
    }

    let hash = hash_password(&body.password).map_err(HubError::Internal)?;
    let verified = !state.config.auth.require_email_verification;

    sqlx::query(
        r#"INSERT INTO "user"
           (id, name, normalized_name, email, password_hash, email_verified, is_active,
            private_quota_bytes, public_quota_bytes, private_used_bytes, public_used_bytes,
            created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
    )
    .bind(db::new_id())
    .bind(&body.username)
    .bind(&normalized)
    .bind(&body.email)
    .bind(&hash)
    .bind(verified)
    .bind(true)
    .bind(state.config.quota.default_user_private_quota_bytes)
    .bind(state.config.quota.default_user_public_quota_bytes)
    .bind(0i64)
    .bind(0i64)
    .bind(db::now_unix())
    .execute(&state.pool)
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"success": true, "username": body.username})),
    ))
}

#[tracing::instrument(skip(state, body), fields(username = %body.username), err)]
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, HubError> {
    let user = db::get_user_by_name(&state.pool, &body.username)
        .await?
        .filter(|u| u.is_active)
        .ok_or(HubError::Unauthorized)?;

    let hash = user.password_hash.as_deref().ok_or(HubError::Unauthorized)?;
    if !verify_password(&body.password, hash).map_err(HubError::Internal)? {
        return Err(HubError::Unauthorized);
    }
    if state.config.auth.require_email_verification && !user.email_verified {
        return Err(HubError::Forbidden);
    }

    let session_id = token::generate_session_id();
    let expires_at = db::now_unix() + state.config.auth.session_expire_hours * 3600;
    db::create_session(&state.pool, &session_id, &user.id, expires_at).await?;

    let max_age = state.config.auth.session_expire_hours * 3600;
    let cookie = format!("session={session_id}; Max-Age={max_age}; HttpOnly; SameSite=Lax; Path=/");

    let mut response =
        Json(serde_json::json!({"success": true, "username": user.name})).into_response();
    response
        .headers_mut()
        .insert(SET_COOKIE, cookie.parse().expect("valid cookie"));
    Ok(response)
}

async fn logout(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Response, HubError> {
    if let Some(session_id) = super::middleware::extract_cookie(&headers, "session") {
        db::delete_session(&state.pool, &session_id).await?;
    }

    let mut response = Json(serde_json::json!({"success": true})).into_response();
    response.headers_mut().insert(
        SET_COOKIE,
        "session=; Max-Age=0; HttpOnly; SameSite=Lax; Path=/"
            .parse()
            .expect("valid cookie"),
    );
    Ok(response)
}

async fn me(auth: AuthUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "username": auth.user.name,
        "email": auth.user.email,
        "emailVerified": auth.user.email_verified,
        "auth": { "type": if auth.via_token { "access_token" } else { "session" } },
    }))
}

#[tracing::instrument(skip(state, auth, body), err)]
async fn create_token(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateTokenRequest>,
) -> Result<impl IntoResponse, HubError> {
    let (raw, hash) = token::generate_api_token();

    sqlx::query(
        "INSERT INTO token (id, user_id, token_hash, name, last_used, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(db::new_id())
    .bind(&auth.user.id)
    .bind(&hash)
    .bind(&body.name)
    .bind(None::<i64>)
    .bind(db::now_unix())
    .execute(&state.pool)
    .await?;

    // The raw secret is only ever returned here.
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"token": raw, "name": body.name})),
    ))
}

async fn list_tokens(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, HubError> {
    let rows = sqlx::query_as::<_, db::TokenRow>(
        "SELECT * FROM token WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(&auth.user.id)
    .fetch_all(&state.pool)
    .await?;

    let tokens: Vec<serde_json::Value> = rows
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "name": t.name,
                "lastUsed": t.last_used,
                "createdAt": t.created_at,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({"tokens": tokens})))
}

async fn delete_token(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(token_id): Path<String>,
) -> Result<Json<serde_json::Value>, HubError> {
    let result = sqlx::query("DELETE FROM token WHERE id = $1 AND user_id = $2")
        .bind(&token_id)
        .bind(&auth.user.id)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(HubError::EntryNotFound("token".into()));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("alice-dev_1.5").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("white space").is_err());
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("correcthorsebatterystaple").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correcthorsebatterystaple", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn password_hashes_are_salted() {
        let first = hash_password("same").unwrap();
        let second = hash_password("same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_stored_hash_is_an_error() {
        assert!(verify_password("anything", "not-a-phc-string").is_err());
    }
}
