//! An issuer that uses an OAuth2 server as an authority

use std::{marker::PhantomData, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use super::{CredentialIssuer, IssuedToken, IssuerError};
use crate::{AccessTokenRef, ClientId, ClientSecret};

pub mod dto;

/// How long a request to the authority may take when no HTTP client is
/// provided
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the client proves its identity to the authority
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientAuthentication {
    /// Sends the client ID and secret using HTTP basic authentication
    #[default]
    Basic,
    /// Sends the client ID and secret as part of the request body
    RequestBody,
}

/// An issuer for the client credentials flow
///
/// Tokens are requested from the token endpoint. If a revocation endpoint is
/// configured, tokens are revoked there; otherwise revocation is a no-op and
/// tokens are left to expire. Refreshing revokes the current token and then
/// requests a new one.
#[derive(Debug)]
pub struct ClientCredentialsIssuer<T = FormBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    revoke_url: Option<reqwest::Url>,
    credentials: dto::ClientCredentials,
    scope: Option<String>,
    audience: Option<String>,
    authentication: ClientAuthentication,
    content_type: PhantomData<fn() -> T>,
}

impl ClientCredentialsIssuer<FormBody> {
    /// Starts building a new client credentials issuer
    pub fn builder() -> ClientCredentialsIssuerBuilder {
        ClientCredentialsIssuerBuilder::default()
    }

    /// Configures the issuer to send token requests to the authority as JSON
    ///
    /// Revocation requests are always sent as form data.
    pub fn using_json_body(self) -> ClientCredentialsIssuer<JsonBody> {
        ClientCredentialsIssuer {
            client: self.client,
            token_url: self.token_url,
            revoke_url: self.revoke_url,
            credentials: self.credentials,
            scope: self.scope,
            audience: self.audience,
            authentication: self.authentication,
            content_type: PhantomData,
        }
    }
}

impl<T: RequestType> ClientCredentialsIssuer<T> {
    fn body_credentials(&self) -> Option<dto::BodyCredentials<'_>> {
        match self.authentication {
            ClientAuthentication::Basic => None,
            ClientAuthentication::RequestBody => Some((&self.credentials).into()),
        }
    }

    fn authenticate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.authentication {
            ClientAuthentication::Basic => request.basic_auth(
                self.credentials.client_id.as_str(),
                Some(self.credentials.client_secret.as_str()),
            ),
            ClientAuthentication::RequestBody => request,
        }
    }

    #[tracing::instrument(
        err,
        skip(self),
        fields(
            token_url = %self.token_url,
            credentials.client_id = %self.credentials.client_id,
        ),
    )]
    async fn request_token(&self) -> Result<IssuedToken, IssuerError> {
        tracing::trace!("requesting token from authority");

        let payload = dto::TokenRequest {
            grant_type: "client_credentials",
            scope: self.scope.as_deref(),
            audience: self.audience.as_deref(),
            credentials: self.body_credentials(),
        };

        let req = self.authenticate(T::attach_payload(
            self.client.post(self.token_url.clone()),
            &payload,
        ));
        let resp = req.send().await.map_err(IssuerError::transport)?;
        let status = resp.status();

        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        let body = resp.bytes().await.map_err(IssuerError::transport)?;

        if let Some(rejection) = dto::ErrorResponse::rejection(&body) {
            return Err(rejection);
        }

        if !status.is_success() {
            return Err(unexpected_status(status, &body));
        }

        let resp: dto::TokenResponse = serde_json::from_slice(&body).map_err(|err| {
            IssuerError::MalformedResponse(format!("unable to parse token response: {}", err))
        })?;

        if resp.access_token.as_str().is_empty() || resp.expires_in == 0 {
            return Err(IssuerError::MalformedResponse(
                "response did not contain access_token and expires_in".to_owned(),
            ));
        }

        tracing::info!(
            lifetime = resp.expires_in,
            token_type = resp.token_type.as_deref().unwrap_or("unspecified"),
            scope = resp.scope.as_deref().unwrap_or(""),
            "received new token"
        );

        Ok(IssuedToken::new(
            resp.access_token,
            Duration::from_secs(resp.expires_in),
        ))
    }

    #[tracing::instrument(
        err,
        skip(self, token),
        fields(
            revoke_url = tracing::field::Empty,
            credentials.client_id = %self.credentials.client_id,
        ),
    )]
    async fn revoke_token(&self, token: &AccessTokenRef) -> Result<(), IssuerError> {
        let Some(revoke_url) = &self.revoke_url else {
            tracing::debug!("no revocation endpoint configured, leaving token to expire");
            return Ok(());
        };
        tracing::Span::current().record("revoke_url", tracing::field::display(revoke_url));

        let payload = dto::RevokeRequest {
            token,
            credentials: self.body_credentials(),
        };

        let req = self.authenticate(self.client.post(revoke_url.clone()).form(&payload));
        let resp = req.send().await.map_err(IssuerError::transport)?;
        let status = resp.status();

        tracing::debug!(
            response.status = status.as_u16(),
            "received revocation response from issuing authority"
        );

        let body = resp.bytes().await.map_err(IssuerError::transport)?;

        if let Some(rejection) = dto::ErrorResponse::rejection(&body) {
            return Err(rejection);
        }

        if !status.is_success() {
            return Err(unexpected_status(status, &body));
        }

        Ok(())
    }
}

fn unexpected_status(status: reqwest::StatusCode, body: &[u8]) -> IssuerError {
    IssuerError::MalformedResponse(format!(
        "unexpected status {} from authority: {}",
        status,
        String::from_utf8_lossy(body)
    ))
}

#[async_trait]
impl<T: RequestType> CredentialIssuer for ClientCredentialsIssuer<T> {
    async fn fetch(&mut self) -> Result<IssuedToken, IssuerError> {
        self.request_token().await
    }

    async fn revoke(&mut self, token: &AccessTokenRef) -> Result<(), IssuerError> {
        self.revoke_token(token).await
    }
}

/// Builds a [`ClientCredentialsIssuer`]
#[derive(Debug, Default)]
pub struct ClientCredentialsIssuerBuilder {
    client: Option<reqwest::Client>,
    token_url: Option<reqwest::Url>,
    revoke_url: Option<reqwest::Url>,
    client_id: Option<ClientId>,
    client_secret: Option<ClientSecret>,
    scope: Option<String>,
    audience: Option<String>,
    authentication: ClientAuthentication,
}

impl ClientCredentialsIssuerBuilder {
    /// Sets the HTTP client used to talk to the authority
    ///
    /// Defaults to a client with a timeout of [`DEFAULT_TIMEOUT`].
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets the authority's token endpoint (required)
    pub fn token_url(mut self, token_url: reqwest::Url) -> Self {
        self.token_url = Some(token_url);
        self
    }

    /// Sets the authority's revocation endpoint
    pub fn revoke_url(mut self, revoke_url: reqwest::Url) -> Self {
        self.revoke_url = Some(revoke_url);
        self
    }

    /// Sets the client ID (required)
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Sets the client secret (required)
    pub fn client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Sets the scope to request
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the audience to request a token for
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets how the client authenticates itself to the authority
    pub fn client_authentication(mut self, authentication: ClientAuthentication) -> Self {
        self.authentication = authentication;
        self
    }

    /// Builds the issuer
    ///
    /// Fails listing every required setting that was not provided.
    pub fn build(self) -> Result<ClientCredentialsIssuer, ConfigError> {
        let mut needs = Vec::new();
        if self.token_url.is_none() {
            needs.push("token_url");
        }
        if self.client_id.is_none() {
            needs.push("client_id");
        }
        if self.client_secret.is_none() {
            needs.push("client_secret");
        }

        let (Some(token_url), Some(client_id), Some(client_secret)) =
            (self.token_url, self.client_id, self.client_secret)
        else {
            return Err(ConfigError::MissingSettings { needs });
        };

        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .map_err(ConfigError::Client)?,
        };

        Ok(ClientCredentialsIssuer {
            client,
            token_url,
            revoke_url: self.revoke_url,
            credentials: dto::ClientCredentials {
                client_id,
                client_secret,
            },
            scope: self.scope,
            audience: self.audience,
            authentication: self.authentication,
            content_type: PhantomData,
        })
    }
}

/// An error while configuring a [`ClientCredentialsIssuer`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required settings were not provided
    #[error("client credentials issuer is missing required settings: {}", .needs.join(", "))]
    MissingSettings {
        /// The names of the missing settings
        needs: Vec<&'static str>,
    },
    /// The default HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    Client(#[source] reqwest::Error),
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync + 'static {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches the payload to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches the payload to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    use super::*;
    use crate::{AccessToken, CredentialError, TokenCache};

    const BASIC_AUTH: &str = "Basic Y2xpZW50OnNlY3JldA==";

    fn builder(server: &MockServer) -> ClientCredentialsIssuerBuilder {
        ClientCredentialsIssuer::builder()
            .token_url(server.url("/token").parse().unwrap())
            .revoke_url(server.url("/revoke").parse().unwrap())
            .client_id(ClientId::from_static("client"))
            .client_secret(ClientSecret::from_static("secret"))
    }

    mod when_building {
        use super::*;

        #[test]
        fn every_missing_setting_is_reported() {
            let err = ClientCredentialsIssuer::builder().build().unwrap_err();

            match &err {
                ConfigError::MissingSettings { needs } => {
                    assert_eq!(needs, &["token_url", "client_id", "client_secret"]);
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(
                err.to_string(),
                "client credentials issuer is missing required settings: token_url, client_id, client_secret"
            );
        }

        #[test]
        fn revoke_url_is_optional() {
            let issuer = ClientCredentialsIssuer::builder()
                .token_url("https://example.com/token".parse().unwrap())
                .client_id(ClientId::from_static("client"))
                .client_secret(ClientSecret::from_static("secret"))
                .build();

            assert!(issuer.is_ok());
        }
    }

    mod when_fetching {
        use super::*;

        #[tokio::test]
        async fn sends_a_client_credentials_grant_with_basic_auth() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/token")
                        .header("authorization", BASIC_AUTH)
                        .body("grant_type=client_credentials");
                    then.status(200).json_body(json!({
                        "access_token": "abc",
                        "token_type": "Bearer",
                        "scope": "read",
                        "expires_in": 60,
                    }));
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let issued = issuer.fetch().await.unwrap();

            mock.assert_async().await;
            assert_eq!(issued.access_token.as_str(), "abc");
            assert_eq!(issued.expires_in, Duration::from_secs(60));
        }

        #[tokio::test]
        async fn sends_credentials_in_the_body_when_asked() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST).path("/token").body(
                        "grant_type=client_credentials&scope=read+write&client_id=client&client_secret=secret",
                    );
                    then.status(200)
                        .json_body(json!({ "access_token": "abc", "expires_in": 60 }));
                })
                .await;
            let mut issuer = builder(&server)
                .scope("read write")
                .client_authentication(ClientAuthentication::RequestBody)
                .build()
                .unwrap();

            issuer.fetch().await.unwrap();

            mock.assert_async().await;
        }

        #[tokio::test]
        async fn structured_errors_are_rejections() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/token");
                    then.status(401).json_body(json!({
                        "error": "invalid_client",
                        "error_description": "unknown client",
                    }));
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let err = issuer.fetch().await.unwrap_err();

            match err {
                IssuerError::Rejected { error, description } => {
                    assert_eq!(error, "invalid_client");
                    assert_eq!(description.as_deref(), Some("unknown client"));
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn structured_errors_with_success_status_are_still_rejections() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/token");
                    then.status(200)
                        .json_body(json!({ "error": "invalid_grant" }));
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let err = issuer.fetch().await.unwrap_err();

            assert!(matches!(err, IssuerError::Rejected { .. }));
        }

        #[tokio::test]
        async fn incomplete_tokens_are_malformed() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/token");
                    then.status(200)
                        .json_body(json!({ "access_token": "abc" }));
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let err = issuer.fetch().await.unwrap_err();

            assert!(matches!(err, IssuerError::MalformedResponse(_)));
            assert!(err.is_transport());
        }

        #[tokio::test]
        async fn unparseable_bodies_are_malformed() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/token");
                    then.status(200).body("<html>oops</html>");
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let err = issuer.fetch().await.unwrap_err();

            assert!(matches!(err, IssuerError::MalformedResponse(_)));
        }

        #[tokio::test]
        async fn server_errors_without_a_body_are_malformed() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/token");
                    then.status(503);
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let err = issuer.fetch().await.unwrap_err();

            assert!(err.to_string().contains("503"));
        }

        #[tokio::test]
        async fn unreachable_authority_is_a_transport_error() {
            let mut issuer = ClientCredentialsIssuer::builder()
                .token_url("http://127.0.0.1:1/token".parse().unwrap())
                .client_id(ClientId::from_static("client"))
                .client_secret(ClientSecret::from_static("secret"))
                .build()
                .unwrap();

            let err = issuer.fetch().await.unwrap_err();

            assert!(matches!(err, IssuerError::Transport(_)));
        }

        #[tokio::test]
        async fn json_bodies_can_be_used_for_token_requests() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/token")
                        .json_body(json!({ "grant_type": "client_credentials", "audience": "api" }));
                    then.status(200)
                        .json_body(json!({ "access_token": "abc", "expires_in": 60 }));
                })
                .await;
            let mut issuer = builder(&server)
                .audience("api")
                .build()
                .unwrap()
                .using_json_body();

            issuer.fetch().await.unwrap();

            mock.assert_async().await;
        }
    }

    mod when_revoking {
        use super::*;

        #[tokio::test]
        async fn posts_the_token_to_the_revocation_endpoint() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/revoke")
                        .header("authorization", BASIC_AUTH)
                        .body("token=abc");
                    then.status(200);
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            issuer
                .revoke(&AccessToken::from_static("abc"))
                .await
                .unwrap();

            mock.assert_async().await;
        }

        #[tokio::test]
        async fn rejections_are_reported() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/revoke");
                    then.status(400)
                        .json_body(json!({ "error": "unsupported_token_type" }));
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let err = issuer
                .revoke(&AccessToken::from_static("abc"))
                .await
                .unwrap_err();

            assert!(matches!(err, IssuerError::Rejected { .. }));
        }

        #[tokio::test]
        async fn is_skipped_without_a_revocation_endpoint() {
            let mut issuer = ClientCredentialsIssuer::builder()
                .token_url("http://127.0.0.1:1/token".parse().unwrap())
                .client_id(ClientId::from_static("client"))
                .client_secret(ClientSecret::from_static("secret"))
                .build()
                .unwrap();

            assert!(issuer
                .revoke(&AccessToken::from_static("abc"))
                .await
                .is_ok());
        }

        #[tokio::test]
        async fn refresh_revokes_then_fetches() {
            let server = MockServer::start_async().await;
            let revoke = server
                .mock_async(|when, then| {
                    when.method(POST).path("/revoke").body("token=abc");
                    then.status(200);
                })
                .await;
            let token = server
                .mock_async(|when, then| {
                    when.method(POST).path("/token");
                    then.status(200)
                        .json_body(json!({ "access_token": "def", "expires_in": 60 }));
                })
                .await;
            let mut issuer = builder(&server).build().unwrap();

            let issued = issuer
                .refresh(&AccessToken::from_static("abc"))
                .await
                .unwrap();

            revoke.assert_async().await;
            token.assert_async().await;
            assert_eq!(issued.access_token.as_str(), "def");
        }
    }

    #[tokio::test]
    async fn token_cache_fetches_and_revokes_through_the_authority() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body(json!({ "access_token": "abc", "expires_in": 3600 }));
            })
            .await;
        let revoke = server
            .mock_async(|when, then| {
                when.method(POST).path("/revoke").body("token=abc");
                then.status(503);
            })
            .await;
        let issuer = builder(&server).build().unwrap();

        let cache = TokenCache::spawn(issuer).await;
        assert_eq!(cache.access_token().unwrap().as_str(), "abc");

        let first = cache.stop().await;
        let second = cache.stop().await;

        token.assert_async().await;
        revoke.assert_async().await;
        assert!(matches!(
            first,
            Err(CredentialError::Revoke(IssuerError::MalformedResponse(_)))
        ));
        assert_eq!(
            first.unwrap_err().to_string(),
            second.unwrap_err().to_string()
        );
    }
}
