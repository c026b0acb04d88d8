//! Identity token verification
//!
//! MuseStudio does not mint tokens; the external identity provider does. This
//! module only verifies provider-issued HS256 JWTs and extracts the stable
//! user id (`sub`) that keys profiles.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Claims we care about from the provider token.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Expiration
    pub exp: i64,
    /// Provider role, if present ("admin" unlocks admin routes)
    #[serde(default)]
    pub role: Option<String>,
}

/// Verifies provider-issued JWTs.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate and decode a provider token.
    /// Explicit algorithm prevents algorithm confusion attacks.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                ApiError::InvalidToken
            })
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)
}

/// Authenticated identity, extracted from the Authorization header.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: Uuid,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let claims = state.jwt.verify(bearer_token(parts)?)?;
        Ok(Identity {
            user_id: claims.sub,
        })
    }
}

/// Identity whose token carries the admin role.
#[derive(Debug, Clone, Copy)]
pub struct AdminIdentity {
    pub user_id: Uuid,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let claims = state.jwt.verify(bearer_token(parts)?)?;
        if claims.role.as_deref() != Some("admin") {
            return Err(ApiError::Forbidden);
        }
        Ok(AdminIdentity {
            user_id: claims.sub,
        })
    }
}
