//! Authentication support for the reference server.
//!
//! Tokens are signed with HMAC-SHA256 and carry their issue time so they
//! can expire or be revoked wholesale.
//!
//! ## Token Format
//!
//! - 16 bytes: user id
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature
//!
//! Total: 56 bytes, hex encoded for transport.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_BYTES: usize = 56;
const SIGNED_BYTES: usize = 24;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// What a valid token says about its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    /// User identifier.
    pub uid: [u8; 16],
    /// Issue time in milliseconds since the Unix epoch.
    pub issued_at: u64,
}

/// Issues and checks session tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `uid`, issued now.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot key the MAC.
    pub fn create_token(&self, uid: [u8; 16]) -> ServerResult<String> {
        let mut data = Vec::with_capacity(TOKEN_BYTES);
        data.extend_from_slice(&uid);
        data.extend_from_slice(&now_millis().to_be_bytes());

        let signature = self.sign(&data)?;
        data.extend_from_slice(&signature);
        Ok(to_hex(&data))
    }

    /// Validates a token and returns the user id it was issued for.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] for malformed, forged or
    /// expired tokens.
    pub fn validate_token(&self, token: &str) -> ServerResult<[u8; 16]> {
        self.claims(token).map(|claims| claims.uid)
    }

    /// Validates a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] for malformed, forged or
    /// expired tokens.
    pub fn claims(&self, token: &str) -> ServerResult<TokenClaims> {
        let bytes = from_hex(token)
            .filter(|b| b.len() == TOKEN_BYTES)
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;

        let (signed, signature) = bytes.split_at(SIGNED_BYTES);
        let mut mac = self.mac()?;
        mac.update(signed);
        mac.verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("invalid signature".into()))?;

        let mut uid = [0u8; 16];
        uid.copy_from_slice(&signed[..16]);
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&signed[16..]);
        let issued_at = u64::from_be_bytes(stamp);

        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthorized("token expired".into()));
        }

        Ok(TokenClaims { uid, issued_at })
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("bad auth secret: {e}")))
    }

    fn sign(&self, data: &[u8]) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}
