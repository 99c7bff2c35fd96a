//! Token authentication for the reference service.
//!
//! Tokens are HMAC-SHA256 signed and carry an expiry:
//!
//! ```text
//! <identity>.<expiry unix millis>.<hex signature>
//! ```
//!
//! The signature covers `<identity>.<expiry unix millis>`.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token lifetime.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(60 * 60), // 1 hour
        }
    }

    /// Sets the token lifetime.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Claims carried by a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Identity the token was issued to.
    pub identity: String,
    /// When the token stops being accepted, if ever.
    pub expires_at: Option<SystemTime>,
}

/// Issues and validates signed tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `identity`, valid for the configured lifetime
    /// starting at `now`.
    pub fn create_token(&self, identity: &str, now: SystemTime) -> ServerResult<String> {
        if identity.is_empty() {
            return Err(ServerError::InvalidRequest("empty identity".into()));
        }
        let expires = now + self.config.token_expiry;
        let millis = expires
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let body = format!("{identity}.{millis}");
        let signature = self.sign(body.as_bytes())?;
        Ok(format!("{body}.{}", to_hex(&signature)))
    }

    /// Validates a token at `now` and returns its claims.
    pub fn validate_token(&self, token: &str, now: SystemTime) -> ServerResult<TokenClaims> {
        let mut parts = token.rsplitn(3, '.');
        let (Some(signature), Some(millis), Some(identity)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ServerError::AuthenticationFailed("malformed token".into()));
        };

        let signature = from_hex(signature)
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed signature".into()))?;
        let body_len = identity.len() + 1 + millis.len();
        self.verify(&token.as_bytes()[..body_len], &signature)?;

        let millis: u64 = millis
            .parse()
            .map_err(|_| ServerError::AuthenticationFailed("malformed expiry".into()))?;
        let expires_at = UNIX_EPOCH + Duration::from_millis(millis);
        if now >= expires_at {
            return Err(ServerError::TokenExpired);
        }

        Ok(TokenClaims {
            identity: identity.to_string(),
            expires_at: Some(expires_at),
        })
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid auth secret: {e}")))
    }

    fn sign(&self, data: &[u8]) -> ServerResult<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> ServerResult<()> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))
    }
}

/// Accepts any non-empty token and uses it as the identity.
///
/// Used when the service runs without authentication.
pub fn open_claims(token: &str) -> ServerResult<TokenClaims> {
    if token.is_empty() {
        return Err(ServerError::AuthenticationFailed("empty token".into()));
    }
    Ok(TokenClaims {
        identity: token.to_string(),
        expires_at: None,
    })
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let now = SystemTime::now();

        let token = validator.create_token("alice", now).unwrap();
        let claims = validator.validate_token(&token, now).unwrap();
        assert_eq!(claims.identity, "alice");
        assert!(claims.expires_at.unwrap() > now);
    }

    #[test]
    fn identity_may_contain_dots() {
        let validator = validator();
        let now = SystemTime::now();

        let token = validator.create_token("alice.example.com", now).unwrap();
        let claims = validator.validate_token(&token, now).unwrap();
        assert_eq!(claims.identity, "alice.example.com");
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let now = SystemTime::now();

        let token = validator.create_token("alice", now).unwrap();
        let forged = token.replacen("alice", "mallory", 1);

        let result = validator.validate_token(&forged, now);
        assert!(matches!(result, Err(ServerError::AuthenticationFailed(_))));
    }

    #[test]
    fn reject_foreign_secret() {
        let now = SystemTime::now();
        let token = validator().create_token("alice", now).unwrap();

        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token, now).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
                .with_expiry(Duration::from_secs(60)),
        );
        let issued = SystemTime::now();
        let token = validator.create_token("alice", issued).unwrap();

        let later = issued + Duration::from_secs(61);
        assert_eq!(
            validator.validate_token(&token, later),
            Err(ServerError::TokenExpired)
        );
    }

    #[test]
    fn reject_garbage() {
        let validator = validator();
        assert!(validator.validate_token("garbage", SystemTime::now()).is_err());
        assert!(validator
            .validate_token("a.b.zz", SystemTime::now())
            .is_err());
    }

    #[test]
    fn open_claims_require_token() {
        assert_eq!(open_claims("bob").unwrap().identity, "bob");
        assert!(open_claims("").is_err());
    }
}
