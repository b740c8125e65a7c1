//! WebSocket authentication.
//!
//! The gateway hands the upgrade's query parameters to an [`Authenticator`]
//! and gets back the [`UserId`] the connection belongs to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{InvalidId, UserId};
use relay_settings::AuthSettings;
use tracing::warn;

use crate::errors::AuthError;

/// Credentials presented on upgrade.
#[derive(Clone, Debug, Default)]
pub struct AuthRequest {
    /// Bearer token (`?token=`).
    pub token: Option<String>,
    /// Claimed user ID (`?user_id=`), honoured only in development mode.
    pub user_id: Option<String>,
}

/// Maps credentials to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve the request to a user, or reject it.
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserId, AuthError>;
}

/// Fixed token → user table from settings.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    /// Build from `token → user id` pairs; every user ID is validated.
    pub fn new<'a, I>(tokens: I) -> Result<Self, InvalidId>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let tokens = tokens
            .into_iter()
            .map(|(token, user)| Ok((token.clone(), UserId::parse(user)?)))
            .collect::<Result<_, InvalidId>>()?;
        Ok(Self { tokens })
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are configured.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserId, AuthError> {
        let token = request.token.as_deref().ok_or(AuthError::MissingCredentials)?;
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Trusts the `user_id` query parameter. Development only.
#[derive(Debug, Default)]
pub struct QueryParamAuthenticator;

#[async_trait]
impl Authenticator for QueryParamAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserId, AuthError> {
        let raw = request.user_id.as_deref().ok_or(AuthError::MissingCredentials)?;
        Ok(UserId::parse(raw)?)
    }
}

/// Tries each authenticator in order; the first success wins.
pub struct ChainAuthenticator {
    links: Vec<Arc<dyn Authenticator>>,
}

impl ChainAuthenticator {
    /// Chain over `links`.
    pub fn new(links: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { links }
    }
}

#[async_trait]
impl Authenticator for ChainAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserId, AuthError> {
        let mut last = AuthError::MissingCredentials;
        for link in &self.links {
            match link.authenticate(request).await {
                Ok(user) => return Ok(user),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

/// Authenticator for the given settings: the token table, plus the
/// query-parameter fallback when `allow_query_user` is set.
pub fn from_settings(settings: &AuthSettings) -> Result<Arc<dyn Authenticator>, InvalidId> {
    let tokens: Arc<dyn Authenticator> = Arc::new(StaticTokenAuthenticator::new(&settings.tokens)?);
    if !settings.allow_query_user {
        return Ok(tokens);
    }
    warn!("query-parameter authentication enabled; do not use in production");
    Ok(Arc::new(ChainAuthenticator::new(vec![
        tokens,
        Arc::new(QueryParamAuthenticator),
    ])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn request(token: Option<&str>, user: Option<&str>) -> AuthRequest {
        AuthRequest {
            token: token.map(str::to_owned),
            user_id: user.map(str::to_owned),
        }
    }

    fn settings(allow_query_user: bool) -> AuthSettings {
        let mut tokens = BTreeMap::new();
        let _ = tokens.insert("tok-alice".to_owned(), "alice".to_owned());
        AuthSettings {
            tokens,
            allow_query_user,
        }
    }

    #[tokio::test]
    async fn static_tokens() {
        let auth = StaticTokenAuthenticator::new(&settings(false).tokens).unwrap();
        assert_eq!(auth.len(), 1);
        assert_eq!(
            auth.authenticate(&request(Some("tok-alice"), None)).await.unwrap(),
            UserId::from("alice")
        );
        assert_matches!(
            auth.authenticate(&request(Some("nope"), None)).await,
            Err(AuthError::InvalidToken)
        );
        assert_matches!(
            auth.authenticate(&request(None, Some("alice"))).await,
            Err(AuthError::MissingCredentials)
        );
    }

    #[test]
    fn static_tokens_validate_user_ids() {
        let mut tokens = BTreeMap::new();
        let _ = tokens.insert("t".to_owned(), "has space".to_owned());
        assert!(StaticTokenAuthenticator::new(&tokens).is_err());
    }

    #[tokio::test]
    async fn query_param_validates() {
        let auth = QueryParamAuthenticator;
        assert_eq!(
            auth.authenticate(&request(None, Some("bob"))).await.unwrap(),
            UserId::from("bob")
        );
        assert_matches!(
            auth.authenticate(&request(None, Some(""))).await,
            Err(AuthError::InvalidUserId(_))
        );
    }

    #[tokio::test]
    async fn settings_without_dev_mode_ignore_user_param() {
        let auth = from_settings(&settings(false)).unwrap();
        assert!(auth.authenticate(&request(None, Some("mallory"))).await.is_err());
    }

    #[tokio::test]
    async fn settings_with_dev_mode_fall_back_to_user_param() {
        let auth = from_settings(&settings(true)).unwrap();
        assert_eq!(
            auth.authenticate(&request(Some("tok-alice"), Some("bob"))).await.unwrap(),
            UserId::from("alice")
        );
        assert_eq!(
            auth.authenticate(&request(None, Some("bob"))).await.unwrap(),
            UserId::from("bob")
        );
    }
}
