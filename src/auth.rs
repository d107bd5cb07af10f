use crate::error::Error;
use secrecy::SecretString;
use std::future::Future;

/// Credential source consulted once per connect attempt.
///
/// The manager fetches a fresh token before every connection attempt,
/// including automatic reconnects, so short-lived credentials keep
/// working across session drops. The token travels inside the first
/// frame on the wire and is never placed in the URL.
///
/// # Example
///
/// ```ignore
/// use ws_session_pool::{TokenProvider, Error};
/// use secrecy::SecretString;
///
/// struct ApiTokenProvider {
///     client: reqwest::Client,
/// }
///
/// impl TokenProvider for ApiTokenProvider {
///     fn auth_token(&self) -> impl Future<Output = Result<SecretString, Error>> + Send {
///         async move {
///             // fetch from your auth endpoint
///             Ok(SecretString::from("token".to_string()))
///         }
///     }
/// }
/// ```
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns a bearer token for the auth handshake.
    ///
    /// Failures surface as [`Error::Credential`] from `connect()` on the
    /// first attempt, and as connection errors during reconnects.
    fn auth_token(&self) -> impl Future<Output = Result<SecretString, Error>> + Send;
}

/// Provider backed by a fixed token. Useful for long-lived API keys
/// and for tests.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    /// Create a provider that always returns the given token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn auth_token(&self) -> impl Future<Output = Result<SecretString, Error>> + Send {
        let token = self.token.clone();
        async move { Ok(SecretString::from(token)) }
    }
}
