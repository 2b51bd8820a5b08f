//! Server configuration.

use crate::rules::Rules;
use std::time::Duration;

/// Configuration for the reference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Whether a valid token is required to open a session.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// How long issued tokens stay valid.
    pub token_expiry: Duration,
    /// Initial read/write rules.
    pub rules: Rules,
}

impl ServerConfig {
    /// Creates a configuration without authentication and with open rules.
    pub fn new() -> Self {
        Self {
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(60 * 60),
            rules: Rules::open(),
        }
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Sets the initial rules.
    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = rules;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
