//! Bearer credential verification (spec.md §6).
//!
//! The core never issues or refreshes credentials — it only verifies the
//! signing material produced by the out-of-scope auth collaborator and
//! resolves a [`UserId`] from the verified claims.

use crate::config::Config;
use crate::domain::UserId;
use crate::error::AppError;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[allow(dead_code)] // standard JWT expiry field, validated by jsonwebtoken
    pub exp: usize,
    /// Present only on credentials issued for the `InternalService` policy.
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Clone)]
pub struct AuthVerifier {
    secret: String,
}

impl AuthVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            secret: config.jwt_signing_secret.clone(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|_| AppError::Unauthenticated)
    }

    /// Verify the `InternalService` authorization policy credential
    /// (issued out-of-band, separate from end-user bearer credentials).
    pub fn verify_internal(&self, token: &str, expected: &str) -> Result<(), AppError> {
        if token == expected {
            return Ok(());
        }
        let claims = self.verify(token)?;
        if claims.scope.as_deref() == Some("InternalService") {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

/// Extract the bearer credential from either the `Authorization` header or
/// the `access_token` query parameter. The query-parameter form is mandatory
/// because browser-side duplex handshakes cannot set headers.
pub fn extract_bearer(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    let query = parts.uri.query().unwrap_or("");
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "access_token").then(|| urldecode(value))
    })
}

/// Axum extractor resolving the authenticated [`UserId`] for REST handlers.
/// Connections with absent/invalid/expired credentials are refused (401)
/// before the handler body runs.
pub struct AuthenticatedUser(pub UserId);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    AuthVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = AuthVerifier::from_ref(state);
        let token = extract_bearer(parts).ok_or(AppError::Unauthenticated)?;
        let claims = verifier.verify(&token)?;
        Ok(AuthenticatedUser(UserId(claims.sub)))
    }
}

/// Axum extractor enforcing the `InternalService` authorization policy on
/// the service-to-service endpoints (spec.md §6).
pub struct InternalServiceCaller;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for InternalServiceCaller
where
    AuthVerifier: FromRef<S>,
    Config: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = AuthVerifier::from_ref(state);
        let config = Config::from_ref(state);
        let token = extract_bearer(parts).ok_or(AppError::Unauthenticated)?;
        verifier.verify_internal(&token, &config.internal_service_token)?;
        Ok(InternalServiceCaller)
    }
}

/// Minimal percent-decoding for the `access_token` query parameter; tokens
/// in practice are base64url and rarely contain characters that need
/// decoding, but `+`/`%XX` can appear in other query string values.
fn urldecode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn verifier() -> AuthVerifier {
        AuthVerifier {
            secret: "test-secret".to_string(),
        }
    }

    #[test]
    fn verifies_well_formed_token() {
        let v = verifier();
        let claims = Claims {
            sub: "user-1".to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            scope: None,
        };
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        let verified = v.verify(&token).unwrap();
        assert_eq!(verified.sub, "user-1");
    }

    #[test]
    fn rejects_bad_signature() {
        let v = verifier();
        let claims = Claims {
            sub: "user-1".to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            scope: None,
        };
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"wrong-secret"),
        )
        .unwrap();
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let v = verifier();
        let claims = Claims {
            sub: "user-1".to_string(),
            exp: (chrono::Utc::now().timestamp() - 3600) as usize,
            scope: None,
        };
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn internal_service_accepts_static_token() {
        let v = verifier();
        assert!(v.verify_internal("static-tok", "static-tok").is_ok());
        assert!(v.verify_internal("other", "static-tok").is_err());
    }
}
