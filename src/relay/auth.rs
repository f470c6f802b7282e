// Bearer token verification for incoming connections

use crate::relay::error::RelayError;
use crate::relay::message::UserId;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Maps a bearer token to the user it was issued for
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, RelayError>;
}

/// Issues and verifies HMAC-SHA256 signed tokens
///
/// Format: `<user_id>.<expires_unix_secs>.<hex signature>`, where the
/// signature covers `<user_id>.<expires_unix_secs>`.
pub struct TokenAuthority {
    secret: Vec<u8>,
}

impl TokenAuthority {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for `user` valid for `ttl`
    pub fn issue(&self, user: UserId, ttl: Duration) -> Result<String, RelayError> {
        let expires = current_timestamp().saturating_add(ttl.as_secs());
        self.issue_with_expiry(user, expires)
    }

    fn issue_with_expiry(&self, user: UserId, expires: u64) -> Result<String, RelayError> {
        let claims = format!("{}.{}", user, expires);
        let signature = hex::encode(self.mac(&claims)?.finalize().into_bytes());
        Ok(format!("{}.{}", claims, signature))
    }

    fn mac(&self, claims: &str) -> Result<HmacSha256, RelayError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RelayError::Unauthorized(format!("unusable signing key: {}", e)))?;
        mac.update(claims.as_bytes());
        Ok(mac)
    }
}

impl TokenVerifier for TokenAuthority {
    fn verify(&self, token: &str) -> Result<UserId, RelayError> {
        let (claims, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| RelayError::Unauthorized("malformed token".to_string()))?;

        let signature = hex::decode(signature)
            .map_err(|_| RelayError::Unauthorized("malformed token signature".to_string()))?;

        self.mac(claims)?
            .verify_slice(&signature)
            .map_err(|_| RelayError::Unauthorized("invalid token signature".to_string()))?;

        let (user, expires) = claims
            .split_once('.')
            .ok_or_else(|| RelayError::Unauthorized("malformed token claims".to_string()))?;

        let user = user
            .parse::<u64>()
            .ok()
            .and_then(UserId::new)
            .ok_or_else(|| RelayError::Unauthorized("invalid user in token".to_string()))?;

        let expires: u64 = expires
            .parse()
            .map_err(|_| RelayError::Unauthorized("invalid token expiry".to_string()))?;

        if expires <= current_timestamp() {
            return Err(RelayError::Unauthorized("token expired".to_string()));
        }

        Ok(user)
    }
}

/// Generate a random signing secret
pub fn generate_secret() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    const SECRET_LEN: usize = 48;

    let mut rng = rand::thread_rng();
    (0..SECRET_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Get current timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
