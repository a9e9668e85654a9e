use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::issuer::{IssuedToken, IssuerError};
use crate::{AccessToken, AccessTokenRef};

/// The credential currently held by a token cache
///
/// A credential is either valid, holding a [`Token`], or invalidated, holding
/// the [`CredentialError`] that ended its life. Credentials are never
/// mutated; the refresh worker publishes a new one instead.
#[derive(Debug)]
pub struct Credential {
    inner: Result<Token, CredentialError>,
}

impl Credential {
    pub(crate) fn valid(token: Token) -> Self {
        Self { inner: Ok(token) }
    }

    pub(crate) fn invalidated(error: CredentialError) -> Self {
        Self { inner: Err(error) }
    }

    /// Whether this credential holds a usable token
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.inner.is_ok()
    }

    /// Gets the token, or the error that invalidated the credential
    #[inline]
    pub fn token(&self) -> Result<&Token, &CredentialError> {
        self.inner.as_ref()
    }

    /// Gets the access token, or the error that invalidated the credential
    #[inline]
    pub fn access_token(&self) -> Result<&AccessTokenRef, &CredentialError> {
        self.token().map(Token::access_token)
    }

    /// Gets the error that invalidated this credential, if any
    #[inline]
    pub fn error(&self) -> Option<&CredentialError> {
        self.inner.as_ref().err()
    }

    /// Gets the time that the token expires, if the credential is valid
    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.token().ok().map(Token::expires_at)
    }
}

/// A valid access token with lifetime information
#[derive(Debug)]
pub struct Token {
    access_token: AccessToken,
    lifetime: Duration,
    issued: Instant,
    refresh_at: Instant,
    expires_at: Instant,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not yet due for renewal
    Fresh,
    /// The token is valid, but the worker should be renewing it
    Stale,
    /// The token is no longer valid
    Expired,
}

impl Token {
    /// Computes the lifetime of a newly issued token
    ///
    /// The token becomes due for renewal `margin` before it expires. If the
    /// token's lifetime does not exceed `margin`, it is renewed halfway
    /// through its lifetime instead.
    ///
    /// Fails if the lifetime is too long to be represented as a point in time.
    pub(crate) fn issue(
        issued_token: IssuedToken,
        margin: Duration,
        issued: Instant,
    ) -> Result<Self, IssuerError> {
        let lifetime = issued_token.expires_in;
        let until_refresh = if lifetime > margin {
            lifetime - margin
        } else {
            lifetime / 2
        };

        let (Some(refresh_at), Some(expires_at)) = (
            issued.checked_add(until_refresh),
            issued.checked_add(lifetime),
        ) else {
            return Err(IssuerError::MalformedResponse(format!(
                "token lifetime of {}s is out of range",
                lifetime.as_secs()
            )));
        };

        Ok(Self {
            access_token: issued_token.access_token,
            lifetime,
            issued,
            refresh_at,
            expires_at,
        })
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the token's lifetime as reported by the issuing authority
    #[inline]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Gets the time that the token was received
    #[inline]
    pub fn issued(&self) -> Instant {
        self.issued
    }

    /// Gets the time at which the token will be renewed
    #[inline]
    pub fn refresh_at(&self) -> Instant {
        self.refresh_at
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Gets the token's current lifecycle status
    #[inline]
    pub fn token_status(&self) -> TokenStatus {
        self.token_status_at(Instant::now())
    }

    /// Gets the token's lifecycle status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: Instant) -> TokenStatus {
        if time < self.refresh_at {
            TokenStatus::Fresh
        } else if time < self.expires_at {
            TokenStatus::Stale
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the token will be valid
    #[inline]
    pub fn until_expired(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// The reason a credential is not usable
#[derive(Clone, Debug, Error)]
pub enum CredentialError {
    /// No credential has been published yet
    #[error("no credential has been issued yet")]
    Initializing,

    /// Obtaining a new credential failed
    #[error("unable to obtain a credential")]
    Fetch(#[source] IssuerError),

    /// Refreshing the previous credential failed
    #[error("unable to refresh the credential")]
    Refresh(#[source] IssuerError),

    /// The issuing authority failed to revoke the credential
    #[error("unable to revoke the credential")]
    Revoke(#[source] IssuerError),

    /// The credential was revoked on request
    #[error("the credential was revoked")]
    Revoked,

    /// The token cache was stopped
    #[error("the token cache has stopped")]
    Stopped {
        /// The error from revoking the last credential during shutdown, if any
        #[source]
        revoke_error: Option<IssuerError>,
    },

    /// An operation was attempted after the token cache had stopped
    #[error("the token cache has already stopped")]
    AlreadyStopped,

    /// The refresh worker died without stopping cleanly
    #[error("the token refresh worker terminated unexpectedly")]
    WorkerTerminated,
}

impl CredentialError {
    /// Gets the issuer error behind this credential error, if any
    pub fn issuer_error(&self) -> Option<&IssuerError> {
        match self {
            Self::Fetch(e) | Self::Refresh(e) | Self::Revoke(e) => Some(e),
            Self::Stopped { revoke_error } => revoke_error.as_ref(),
            _ => None,
        }
    }

    /// Whether this error is terminal for the token cache
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::AlreadyStopped)
    }
}
