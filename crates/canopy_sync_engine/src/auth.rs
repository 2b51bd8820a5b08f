//! Auth collaborator hook.

use crate::error::SyncResult;
use parking_lot::Mutex;

/// Supplies session tokens.
///
/// Consulted before every (re)connect. `force_refresh` is set after the
/// server refused or revoked the previous token.
pub trait TokenProvider: Send + Sync {
    /// Returns the token to present, or `None` to connect anonymously.
    ///
    /// # Errors
    ///
    /// An error aborts the connection attempt.
    fn token(&self, force_refresh: bool) -> SyncResult<Option<String>>;
}

impl<F> TokenProvider for F
where
    F: Fn(bool) -> SyncResult<Option<String>> + Send + Sync,
{
    fn token(&self, force_refresh: bool) -> SyncResult<Option<String>> {
        self(force_refresh)
    }
}

/// A provider that hands out a fixed token, which can be swapped.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: Mutex<Option<String>>,
}

impl StaticTokenProvider {
    /// Creates a provider for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    /// Replaces the token used from the next connect on.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self, _force_refresh: bool) -> SyncResult<Option<String>> {
        Ok(self.token.lock().clone())
    }
}
