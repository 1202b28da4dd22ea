//! Bearer-token authentication and role checks.
//!
//! Tokens are HS256 JWTs issued by an external trust anchor; the API
//! only validates signature, issuer, audience, expiry, and the `role`
//! claim. An empty configured secret disables auth (tests and closed
//! deployments) and grants admin.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

use super::envelope::ApiFailure;
use super::ApiState;

/// Caller roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// JWT claims the pipeline cares about.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: u64,
    pub role: String,
}

/// Authenticated caller identity, extracted from the Bearer token.
pub struct AuthContext {
    pub subject: String,
    pub role: Role,
}

impl AuthContext {
    /// Gate a handler on a minimum role.
    pub fn require(&self, minimum: Role) -> Result<(), ApiFailure> {
        if self.role >= minimum {
            Ok(())
        } else {
            Err(ApiFailure(PipelineError::Validation(format!(
                "role '{:?}' lacks '{minimum:?}' privileges",
                self.role
            ))))
        }
    }
}

#[async_trait]
impl FromRequestParts<ApiState> for AuthContext {
    type Rejection = ApiFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        if state.auth.hs256_secret.is_empty() {
            return Ok(AuthContext {
                subject: "anonymous".to_string(),
                role: Role::Admin,
            });
        }

        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                ApiFailure(PipelineError::Validation("missing Bearer token".into()))
            })?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&state.auth.issuer]);
        validation.set_audience(&[&state.auth.audience]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.auth.hs256_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| ApiFailure(PipelineError::Validation(format!("invalid token: {e}"))))?;

        let role: Role = data
            .claims
            .role
            .parse()
            .map_err(|e: String| ApiFailure(PipelineError::Validation(e)))?;

        Ok(AuthContext {
            subject: data.claims.sub,
            role,
        })
    }
}

/// Mint a token (tests and local tooling; production tokens come from
/// the trust anchor).
pub fn issue_token(
    secret: &str,
    issuer: &str,
    audience: &str,
    subject: &str,
    role: Role,
    ttl_secs: u64,
) -> String {
    let claims = Claims {
        sub: subject.to_string(),
        iss: issuer.to_string(),
        aud: audience.to_string(),
        exp: chrono::Utc::now().timestamp() as u64 + ttl_secs,
        role: format!("{role:?}").to_lowercase(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("HS256 encoding cannot fail")
}
