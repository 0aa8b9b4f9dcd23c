//! Short-lived pull tokens for the proxy.
//!
//! A token is a JWT signed with HS256 over a fixed claim set: subject, scope,
//! issued-at and expiry. Tokens are never stored; validity is decided purely by
//! signature, expiry and scope.

use crate::error::{AuthError, DependencyProxyError, Result};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subject recorded for tokens issued without credentials
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

const ISSUER: &str = "dependency-proxy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullTokenClaims {
    /// Who the token was issued to
    pub sub: String,
    /// Repository path (`group/image`) the token grants pull access to
    pub scope: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expires at (unix seconds)
    pub exp: i64,
    iss: String,
}

/// An encoded token together with the claims it carries
#[derive(Debug, Clone)]
pub struct PullToken {
    pub token: String,
    pub claims: PullTokenClaims,
}

impl PullToken {
    pub fn expires_in(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue_token(&self, subject: &str, scope: &str) -> Result<PullToken> {
        self.issue_token_at(subject, scope, Utc::now().timestamp())
    }

    /// Issue a token as if the current time were `now` (unix seconds)
    pub fn issue_token_at(&self, subject: &str, scope: &str, now: i64) -> Result<PullToken> {
        let claims = PullTokenClaims {
            sub: subject.to_string(),
            scope: scope.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            iss: ISSUER.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| DependencyProxyError::Signing(e.to_string()))?;

        tracing::debug!(
            subject = %subject,
            scope = %scope,
            expires_at = claims.exp,
            "Issued pull token"
        );

        Ok(PullToken { token, claims })
    }

    /// Verify `token` for `required_scope` and return its subject
    pub fn validate_token(&self, token: &str, required_scope: &str) -> std::result::Result<String, AuthError> {
        self.validate_token_at(token, required_scope, Utc::now().timestamp())
    }

    pub fn validate_token_at(
        &self,
        token: &str,
        required_scope: &str,
        now: i64,
    ) -> std::result::Result<String, AuthError> {
        let claims = self.decode_at(token, now)?;
        if claims.scope != required_scope {
            return Err(AuthError::ScopeMismatch {
                expected: required_scope.to_string(),
                actual: claims.scope,
            });
        }
        Ok(claims.sub)
    }

    /// Signature and expiry checks only, for any scope
    pub fn decode(&self, token: &str) -> std::result::Result<PullTokenClaims, AuthError> {
        self.decode_at(token, Utc::now().timestamp())
    }

    fn decode_at(&self, token: &str, now: i64) -> std::result::Result<PullTokenClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked below against the caller's clock
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let claims = decode::<PullTokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidIssuer => AuthError::InvalidSignature,
                _ => AuthError::Malformed,
            })?
            .claims;

        if now >= claims.exp {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}
