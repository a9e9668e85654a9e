//! The issuing authority, as seen by the refresh worker

use std::{error, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef};

#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod oauth2;

/// A shareable, type-erased error
pub type SharedError = Arc<dyn error::Error + Send + Sync + 'static>;

/// A token freshly issued by the authority
#[derive(Debug)]
pub struct IssuedToken {
    /// The access token
    pub access_token: AccessToken,

    /// How long the authority says the token will remain valid
    pub expires_in: Duration,
}

impl IssuedToken {
    /// Constructs a new issued token
    pub fn new(access_token: impl Into<AccessToken>, expires_in: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
        }
    }
}

/// An error reported by a [`CredentialIssuer`]
///
/// Errors are cloneable so that the same failure can be handed to every
/// caller that observes the credential it invalidated.
#[derive(Clone, Debug, Error)]
pub enum IssuerError {
    /// The authority could not be reached, or the exchange failed mid-flight
    #[error("unable to communicate with the issuing authority: {0}")]
    Transport(SharedError),

    /// The authority responded, but not with anything usable
    #[error("malformed response from the issuing authority: {0}")]
    MalformedResponse(String),

    /// The authority answered with a structured error
    #[error(
        "issuing authority rejected the request with `{error}`: {}",
        .description.as_deref().unwrap_or("no description given")
    )]
    Rejected {
        /// The error code returned by the authority
        error: String,
        /// The human readable description, if any
        description: Option<String>,
    },
}

impl IssuerError {
    /// Wraps an underlying transport failure
    pub fn transport<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(error))
    }

    /// Whether the authority was unreachable or answered with garbage, as
    /// opposed to rejecting the request outright
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::MalformedResponse(_))
    }
}

/// A source of credentials, typically a network client for an OAuth2
/// token endpoint
///
/// Implementations need not support concurrent use. The token cache owns its
/// issuer and never has more than one call outstanding against it.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Obtains a brand new token
    async fn fetch(&mut self) -> Result<IssuedToken, IssuerError>;

    /// Replaces `current` with a new token
    ///
    /// By default, this revokes `current` and then fetches a new token. If the
    /// revocation fails, no new token is requested.
    async fn refresh(&mut self, current: &AccessTokenRef) -> Result<IssuedToken, IssuerError> {
        self.revoke(current).await?;
        self.fetch().await
    }

    /// Revokes `token` with the authority
    ///
    /// Revoking a token that the authority has already expired must not fail.
    async fn revoke(&mut self, token: &AccessTokenRef) -> Result<(), IssuerError>;
}

#[async_trait]
impl<I> CredentialIssuer for Box<I>
where
    I: CredentialIssuer + ?Sized,
{
    async fn fetch(&mut self) -> Result<IssuedToken, IssuerError> {
        (**self).fetch().await
    }

    async fn refresh(&mut self, current: &AccessTokenRef) -> Result<IssuedToken, IssuerError> {
        (**self).refresh(current).await
    }

    async fn revoke(&mut self, token: &AccessTokenRef) -> Result<(), IssuerError> {
        (**self).revoke(token).await
    }
}
