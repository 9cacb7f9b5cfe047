//! JWT bearer tokens, HMAC-SHA256 signed.
//!
//! Claims carry the authenticated identity in compact field names plus the
//! registered issuer and expiry. Parsing enforces both.

use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::{request::Parts, StatusCode};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    #[serde(rename = "u")]
    pub user_id: i64,
    /// Role name.
    #[serde(rename = "r")]
    pub role: String,
    /// Platform the token was issued to, as its decimal string.
    #[serde(rename = "p")]
    pub platform: String,
    /// Issuer.
    pub iss: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Extractor for handlers behind the auth pipeline: the pipeline parses the
/// bearer token and stashes the claims in request extensions.
impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Issues and validates HS256 tokens for one issuer.
pub struct Tokens {
    issuer: String,
    ttl: Duration,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Tokens {
    pub fn new(issuer: impl Into<String>, ttl: Duration, secret: &[u8]) -> Tokens {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        Tokens {
            issuer,
            ttl,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn generate(
        &self,
        user_id: i64,
        role: &str,
        platform: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            user_id,
            role: role.to_string(),
            platform: platform.to_string(),
            iss: self.issuer.clone(),
            exp: chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn parse(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Tokens {
        Tokens::new("lariat-test", Duration::from_secs(3600), b"jwt secret")
    }

    #[test]
    fn round_trip_preserves_claims() {
        let token = tokens().generate(42, "admin", "8").unwrap();
        let claims = tokens().parse(&token).unwrap();
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.role, "admin");
        assert_eq!(claims.platform, "8");
        assert_eq!(claims.iss, "lariat-test");
        assert!(claims.exp > chrono::Utc::now().timestamp());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = tokens().generate(1, "user", "1").unwrap();
        let other = Tokens::new("lariat-test", Duration::from_secs(3600), b"different");
        assert!(other.parse(&token).is_err());
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let other = Tokens::new("someone-else", Duration::from_secs(3600), b"jwt secret");
        let token = other.generate(1, "user", "1").unwrap();
        assert!(tokens().parse(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&["lariat-test"]);
        validation.leeway = 0;
        let mut short = tokens();
        short.ttl = Duration::from_secs(0);
        short.validation = validation;
        let token = short.generate(1, "user", "1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(short.parse(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(tokens().parse("not.a.jwt").is_err());
    }
}
