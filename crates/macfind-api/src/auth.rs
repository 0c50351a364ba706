use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{error, info, warn};

use macfind_types::api::{
    Claims, MagicLinkRequest, MagicLinkResponse, SessionResponse, VerifyRequest, VerifyResponse,
};
use macfind_types::tags::validate_campus_email;

use crate::error::ApiError;
use crate::middleware::create_token;
use crate::state::{AppState, db_call};

/// Magic links expire after 15 minutes.
const MAGIC_LINK_TTL_MINUTES: i64 = 15;

/// POST /auth/magic-link — issue a one-time sign-in link. Delivery is out of
/// scope, so the link is written to the log.
pub async fn magic_link(
    State(state): State<AppState>,
    Json(req): Json<MagicLinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Domain check happens before anything touches the store.
    let email = validate_campus_email(&req.email, &state.email_domain).map_err(|e| {
        warn!("Rejected sign-in for '{}': {}", req.email, e);
        ApiError::BadRequest(e.to_string())
    })?;

    let token = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
    let expires_at = chrono::Utc::now() + chrono::Duration::minutes(MAGIC_LINK_TTL_MINUTES);

    let (t, e) = (token.clone(), email.clone());
    db_call(&state, move |db| db.create_login_token(&t, &e, expires_at)).await?;

    let base = callback_base(&state.site_url, req.redirect_to.as_deref());
    info!("Magic link for {}: {}?token={}", email, base, token);

    Ok((
        StatusCode::ACCEPTED,
        Json(MagicLinkResponse {
            sent_to: email,
            expires_at,
        }),
    ))
}

/// POST /auth/verify — exchange a magic-link token for a session token.
pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now();
    let token = req.token;
    let email = db_call(&state, move |db| db.consume_login_token(&token, now))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let e = email.clone();
    let user_id = db_call(&state, move |db| db.upsert_identity(&e)).await?;

    let token = create_token(&state.jwt_secret, user_id, &email).map_err(|e| {
        error!("Failed to sign session token: {}", e);
        ApiError::Internal("failed to sign token".into())
    })?;

    info!("{} signed in as {}", email, user_id);
    Ok(Json(VerifyResponse { user_id, email, token }))
}

/// GET /auth/session — the caller's profile, created on first use.
pub async fn session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (user_id, email) = (claims.sub, claims.email.clone());
    let profile = db_call(&state, move |db| {
        db.ensure_user(user_id, &email, None)?;
        db.get_user(user_id)
    })
    .await?
    .ok_or(ApiError::NotFound("user"))?;

    Ok(Json(SessionResponse { profile }))
}

/// Where the magic link points. A caller-supplied redirect is honoured only
/// when it stays on the site.
fn callback_base(site_url: &str, redirect_to: Option<&str>) -> String {
    let site = site_url.trim_end_matches('/');
    match redirect_to {
        Some(target) if target.starts_with(site) => target.to_string(),
        _ => format!("{}/auth/callback", site),
    }
}
