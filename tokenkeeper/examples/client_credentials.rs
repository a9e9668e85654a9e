use std::time::Duration;

use clap::Parser;
use tokenkeeper::{
    issuer::oauth2::ClientCredentialsIssuer, ClientId, ClientSecret, TokenCache,
    TokenCacheConfig, TokenStatus,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The issuing authority's token revocation URL
    #[arg(short, long, env)]
    revoke_url: Option<reqwest::Url>,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The scope to request
    #[arg(long, env)]
    scope: Option<String>,

    /// How long before expiry to refresh the token, in seconds
    #[arg(long, env, default_value_t = 5)]
    refresh_margin: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut builder = ClientCredentialsIssuer::builder()
        .token_url(opts.token_url)
        .client_id(opts.client_id)
        .client_secret(opts.client_secret);
    if let Some(revoke_url) = opts.revoke_url {
        builder = builder.revoke_url(revoke_url);
    }
    if let Some(scope) = opts.scope {
        builder = builder.scope(scope);
    }
    let issuer = builder.build()?;

    let config =
        TokenCacheConfig::default().with_refresh_margin(Duration::from_secs(opts.refresh_margin));
    let cache = TokenCache::spawn_with_config(issuer, config).await;

    tracing::info!(
        token = format_args!("{:#?}", cache.get_token().access_token()),
        "first access token"
    );

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }

        let snapshot = cache.snapshot();
        let token = match snapshot.credential().token() {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(
                    generation = %snapshot.generation(),
                    error = (error as &dyn std::error::Error),
                    "no usable token, requesting a new one"
                );
                cache.refresh_token().await;
                continue;
            }
        };

        let status = token.token_status();
        let until_expired = token.until_expired().as_secs();
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(?status, until_expired, generation = %snapshot.generation(), "pulled token")
            }
            TokenStatus::Stale => {
                tracing::warn!(?status, until_expired, generation = %snapshot.generation(), "pulled token")
            }
            TokenStatus::Expired => {
                tracing::error!(?status, until_expired, generation = %snapshot.generation(), "pulled token")
            }
        }
    }

    tracing::info!("shutting down");
    cache.stop().await?;

    Ok(())
}
