use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use macfind_types::api::Claims;

use crate::state::AppState;

/// Session lifetime for issued tokens.
const TOKEN_TTL_DAYS: i64 = 30;

/// Extract and validate JWT from Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = decode_token(&state.jwt_secret, token).ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub fn decode_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

pub fn create_token(secret: &str, user_id: Uuid, email: &str) -> jsonwebtoken::errors::Result<String> {
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_only_with_the_same_secret() {
        let user = Uuid::new_v4();
        let token = create_token("s3cret", user, "smithj@mcmaster.ca").unwrap();

        let claims = decode_token("s3cret", &token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.email, "smithj@mcmaster.ca");

        assert!(decode_token("other", &token).is_none());
        assert!(decode_token("s3cret", "garbage").is_none());
    }
}
