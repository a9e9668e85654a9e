//! A single-credential token cache with a serialized background refresh worker
//!
//! Services that call an API protected by a client-credentials OAuth2 flow all
//! need the same thing: a bearer token that is valid whenever they look at it,
//! renewed shortly before it expires, and revoked when the service shuts down.
//! They also need to avoid talking over themselves. Two tasks noticing an
//! expired token at the same time should not each ask the authority for a new
//! one, and a shutdown must not revoke a token twice.
//!
//! [`TokenCache`] provides this. It holds exactly one [`Credential`], which any
//! number of tasks can read without ever waiting on the network. A single
//! background worker owns the [`CredentialIssuer`][issuer::CredentialIssuer]
//! and performs every fetch, refresh and revocation, one at a time. The worker
//! refreshes the token a configurable margin before it expires; callers can
//! also ask for a refresh, a revocation, or shutdown, and wait for the result.
//!
//! Failures are not retried by the worker. When the issuer fails, the cache
//! holds a credential carrying the error, every reader sees that error, and the
//! next call to [`refresh_token()`][TokenCache::refresh_token()] tries again.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use tokenkeeper::{issuer::oauth2::ClientCredentialsIssuer, TokenCache, TokenCacheConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let issuer = ClientCredentialsIssuer::builder()
//!     .token_url("https://auth.example.com/token".parse()?)
//!     .revoke_url("https://auth.example.com/revoke".parse()?)
//!     .client_id("my-client".into())
//!     .client_secret("my-secret".into())
//!     .build()?;
//!
//! let cache = TokenCache::spawn_with_config(
//!     issuer,
//!     TokenCacheConfig::default().with_refresh_margin(Duration::from_secs(10)),
//! )
//! .await;
//!
//! match cache.get_token().access_token() {
//!     Ok(token) => tracing::info!(token = %token, "using token"),
//!     Err(error) => tracing::warn!(%error, "no usable token, asking for a new one"),
//! }
//!
//! cache.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `oauth2` (default): Provides [`ClientCredentialsIssuer`][issuer::oauth2::ClientCredentialsIssuer],
//!   an issuer for OAuth2 authorities supporting the _client credentials_ flow
//!   and, optionally, token revocation.
//! * `rustls-tls`, `default-tls`: Select the TLS backend used by `reqwest`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod cache;
mod credential;
pub mod issuer;
mod store;
mod worker;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use cache::{TokenCache, TokenCacheConfig};
pub use credential::{Credential, CredentialError, Token, TokenStatus};
pub use store::{Generation, Snapshot};
