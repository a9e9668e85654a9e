//! DTOs for interacting with OAuth2 token and revocation endpoints

use serde::{Deserialize, Serialize};

use crate::{
    issuer::IssuerError, AccessToken, AccessTokenRef, ClientId, ClientIdRef, ClientSecret,
    ClientSecretRef,
};

/// Client credentials
#[derive(Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// Client credentials sent in the request body instead of an
/// `Authorization` header
#[derive(Debug, Serialize)]
pub(super) struct BodyCredentials<'a> {
    pub client_id: &'a ClientIdRef,
    pub client_secret: &'a ClientSecretRef,
}

impl<'a> From<&'a ClientCredentials> for BodyCredentials<'a> {
    fn from(credentials: &'a ClientCredentials) -> Self {
        Self {
            client_id: &credentials.client_id,
            client_secret: &credentials.client_secret,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct TokenRequest<'a> {
    pub grant_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<&'a str>,
    #[serde(flatten)]
    pub credentials: Option<BodyCredentials<'a>>,
}

#[derive(Debug, Serialize)]
pub(super) struct RevokeRequest<'a> {
    pub token: &'a AccessTokenRef,
    #[serde(flatten)]
    pub credentials: Option<BodyCredentials<'a>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    /// Extracts a structured error from a response body, if it carries one
    ///
    /// Authorities are not consistent about status codes, so any body with an
    /// `error` or `error_description` is treated as a rejection.
    pub fn rejection(body: &[u8]) -> Option<IssuerError> {
        let resp: Self = serde_json::from_slice(body).ok()?;
        if resp.error.is_none() && resp.error_description.is_none() {
            return None;
        }

        Some(IssuerError::Rejected {
            error: resp.error.unwrap_or_else(|| "unspecified_error".to_owned()),
            description: resp.error_description,
        })
    }
}
