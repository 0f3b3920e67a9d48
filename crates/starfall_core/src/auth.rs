//! Token authentication.
//!
//! The world loop only needs a token turned into a stable identity. Real
//! deployments plug an account service in behind [`Authenticator`]; the
//! bundled [`DevTokenAuthenticator`] trusts the token's name part and is meant
//! for local play, tests and the load-test bot.

use crate::types::PlayerId;
use async_trait::async_trait;
use thiserror::Error;

/// Authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Empty token")]
    EmptyToken,
    #[error("Invalid player name: {0}")]
    InvalidName(String),
    #[error("Invalid credentials")]
    InvalidCredentials,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub player_id: PlayerId,
    pub name: String,
}

/// Maps a client token to an identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

const MAX_NAME_LEN: usize = 32;

/// Accepts `name` or `name:secret` tokens.
///
/// When a shared secret is configured, only `name:<secret>` tokens pass.
#[derive(Debug, Clone, Default)]
pub struct DevTokenAuthenticator {
    shared_secret: Option<String>,
}

impl DevTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            shared_secret: Some(secret.into()),
        }
    }

    fn validate_name(name: &str) -> Result<(), AuthError> {
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(AuthError::InvalidName(name.to_string()))
        }
    }
}

#[async_trait]
impl Authenticator for DevTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        let (name, secret) = match token.split_once(':') {
            Some((name, secret)) => (name, Some(secret)),
            None => (token, None),
        };
        Self::validate_name(name)?;

        if let Some(expected) = &self.shared_secret {
            if secret != Some(expected.as_str()) {
                return Err(AuthError::InvalidCredentials);
            }
        }

        Ok(Identity {
            player_id: PlayerId::from_account_name(name),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_names_map_to_stable_ids() {
        let auth = DevTokenAuthenticator::new();
        let a = auth.authenticate("vega").await.unwrap();
        let b = auth.authenticate("vega:whatever").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.player_id, PlayerId::from_account_name("vega"));
    }

    #[tokio::test]
    async fn test_bad_tokens_are_rejected() {
        let auth = DevTokenAuthenticator::new();
        assert_eq!(auth.authenticate("  ").await, Err(AuthError::EmptyToken));
        assert!(matches!(
            auth.authenticate("bad name!").await,
            Err(AuthError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_secret_is_enforced() {
        let auth = DevTokenAuthenticator::with_secret("s3cret");
        assert_eq!(auth.authenticate("vega").await, Err(AuthError::InvalidCredentials));
        assert_eq!(
            auth.authenticate("vega:wrong").await,
            Err(AuthError::InvalidCredentials)
        );
        assert!(auth.authenticate("vega:s3cret").await.is_ok());
    }
}
