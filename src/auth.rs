//! Access-token plumbing.
//!
//! Credential issuance lives outside this crate. The connection layer only consumes a
//! [`TokenProvider`], which is expected to refresh its own tokens.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};

/// Source of bearer tokens for the gateway handshake and the REST collaborators.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns a currently valid access token, refreshing it first if necessary.
    ///
    /// `None` means no credential can be obtained and the caller must fail fast.
    async fn access_token(&self) -> Option<SecretString>;

    /// Whether the user is currently signed in.
    fn is_authenticated(&self) -> bool;
}

/// A [`TokenProvider`] holding a token supplied by the host, e.g. after an interactive login.
///
/// The token can be swapped with [`StaticTokenProvider::set`] and removed with
/// [`StaticTokenProvider::clear`] on logout.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<SecretString>>,
}

impl StaticTokenProvider {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: RwLock::new(Some(SecretString::from(token.into()))),
        }
    }

    pub fn set<S: Into<String>>(&self, token: S) {
        // Option<SecretString> has no inconsistent intermediate state, so a poisoned lock is fine.
        *self.token.write().unwrap_or_else(PoisonError::into_inner) =
            Some(SecretString::from(token.into()));
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Option<SecretString> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_round_trips_token() {
        let provider = StaticTokenProvider::new("token-1");

        assert!(provider.is_authenticated());
        let token = provider.access_token().await.expect("token");
        assert_eq!(token.expose_secret(), "token-1");

        provider.set("token-2");
        let token = provider.access_token().await.expect("token");
        assert_eq!(token.expose_secret(), "token-2");

        provider.clear();
        assert!(!provider.is_authenticated());
        assert!(provider.access_token().await.is_none());
    }

    #[test]
    fn debug_output_redacts_token() {
        let provider = StaticTokenProvider::new("super-secret");

        assert!(!format!("{provider:?}").contains("super-secret"));
    }
}
