use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    issuer::CredentialIssuer,
    store::{Generation, Snapshot, TokenStore},
    worker::{Command, CommandKind, RefreshWorker},
    AccessToken, Credential, CredentialError,
};

/// Configuration for a [`TokenCache`]
#[derive(Clone, Debug)]
pub struct TokenCacheConfig {
    refresh_margin: Duration,
    command_buffer: usize,
}

impl Default for TokenCacheConfig {
    /// Default cache configuration
    ///
    /// Refreshes tokens 5 seconds before they expire, and allows up to 16
    /// commands to queue up for the refresh worker.
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(5),
            command_buffer: 16,
        }
    }
}

impl TokenCacheConfig {
    /// Constructs a new cache configuration
    ///
    /// Tokens will be refreshed `refresh_margin` before they expire. Tokens
    /// with a lifetime shorter than the margin are refreshed halfway through
    /// their lifetime.
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            refresh_margin,
            ..Self::default()
        }
    }

    /// Sets how long before expiry a token is refreshed
    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    /// Sets how many commands may be waiting on the refresh worker before
    /// further callers have to wait to enqueue theirs
    pub fn with_command_buffer(mut self, command_buffer: usize) -> Self {
        self.command_buffer = command_buffer.max(1);
        self
    }

    /// Gets the refresh margin
    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }
}

/// A cache holding a single credential, kept fresh in the background
///
/// All calls against the issuer are made by a single background worker,
/// so no matter how many clones of the cache are in use, there is at most
/// one fetch, refresh or revocation in flight at any time.
///
/// Reading the current credential never waits on the network. Requests for a
/// refresh, a revocation, or shutdown are queued for the worker and
/// answered once their effect has been published.
#[derive(Clone, Debug)]
pub struct TokenCache {
    store: Arc<TokenStore>,
    commands: mpsc::Sender<Command>,
}

impl TokenCache {
    /// Spawns a new token cache with the default configuration
    ///
    /// See [`spawn_with_config()`][Self::spawn_with_config()].
    pub async fn spawn<I>(issuer: I) -> Self
    where
        I: CredentialIssuer + 'static,
    {
        Self::spawn_with_config(issuer, TokenCacheConfig::default()).await
    }

    /// Spawns a new token cache, with its refresh worker running on the
    /// current tokio runtime
    ///
    /// Returns once the initial fetch has completed. If that fetch failed, the
    /// cache holds a credential carrying the error, and a call to
    /// [`refresh_token()`][Self::refresh_token()] will try again.
    pub async fn spawn_with_config<I>(issuer: I, config: TokenCacheConfig) -> Self
    where
        I: CredentialIssuer + 'static,
    {
        let store = Arc::new(TokenStore::new());
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));

        let worker = RefreshWorker::new(issuer, Arc::clone(&store), rx, config.refresh_margin);
        let join = tokio::spawn(worker.run());

        let supervisor_store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("token refresh worker panicked!");
                } else if err.is_cancelled() {
                    tracing::info!("token refresh worker was cancelled");
                }

                let stopped = supervisor_store
                    .read()
                    .credential()
                    .error()
                    .is_some_and(CredentialError::is_stopped);
                if !stopped {
                    supervisor_store
                        .publish(Credential::invalidated(CredentialError::WorkerTerminated));
                }
            }
        });

        let initial = store.wait_for_change(Generation::INITIAL).await;
        match initial.credential().token() {
            Ok(token) => tracing::debug!(
                generation = initial.generation().get(),
                lifetime = token.lifetime().as_secs(),
                "token cache ready"
            ),
            Err(error) => tracing::warn!(
                generation = initial.generation().get(),
                error = (error as &dyn std::error::Error),
                "token cache started without a valid credential"
            ),
        }

        Self {
            store,
            commands: tx,
        }
    }

    /// Gets the current credential
    ///
    /// Never waits on the network. If the credential has been invalidated, its
    /// [`access_token()`][Credential::access_token()] reports why.
    pub fn get_token(&self) -> Arc<Credential> {
        self.store.read().into_credential()
    }

    /// Gets a copy of the current access token, or the error that
    /// invalidated it
    pub fn access_token(&self) -> Result<AccessToken, CredentialError> {
        self.get_token()
            .access_token()
            .map(ToOwned::to_owned)
            .map_err(Clone::clone)
    }

    /// Gets the current credential along with its generation
    pub fn snapshot(&self) -> Snapshot {
        self.store.read()
    }

    /// Waits until a credential newer than `since` has been published
    ///
    /// Returns immediately if that has already happened.
    pub async fn changed(&self, since: Generation) -> Snapshot {
        self.store.wait_for_change(since).await
    }

    /// Asks the worker to replace the current credential, returning the
    /// result
    ///
    /// If the current credential is valid, it is refreshed through the issuer.
    /// Otherwise, a new one is fetched. After the cache has stopped, this
    /// returns the stopped credential without doing anything.
    pub async fn refresh_token(&self) -> Arc<Credential> {
        self.submit(CommandKind::Refresh).await.into_credential()
    }

    /// Asks the worker to revoke the current credential
    ///
    /// Returns an error only if the revocation itself failed, or if the cache
    /// has stopped. If the credential is already invalidated, nothing is sent
    /// to the issuer.
    pub async fn revoke(&self) -> Result<(), CredentialError> {
        let snapshot = self.submit(CommandKind::Invalidate).await;
        match snapshot.credential().error() {
            Some(CredentialError::Revoke(error)) => Err(CredentialError::Revoke(error.clone())),
            Some(CredentialError::Stopped { .. }) | Some(CredentialError::AlreadyStopped) => {
                Err(CredentialError::AlreadyStopped)
            }
            Some(CredentialError::WorkerTerminated) | None => {
                Err(CredentialError::WorkerTerminated)
            }
            Some(_) => Ok(()),
        }
    }

    /// Stops the cache, revoking the current credential if it is valid
    ///
    /// Waits for any call already in flight against the issuer to finish.
    /// Returns the error from revoking the credential, if any. Stopping an
    /// already stopped cache returns the same result again without contacting
    /// the issuer.
    pub async fn stop(&self) -> Result<(), CredentialError> {
        let snapshot = self.submit(CommandKind::Stop).await;
        match snapshot.credential().error() {
            Some(CredentialError::Stopped {
                revoke_error: Some(error),
            }) => Err(CredentialError::Revoke(error.clone())),
            Some(CredentialError::Stopped { revoke_error: None }) => Ok(()),
            Some(other) => Err(other.clone()),
            None => Err(CredentialError::WorkerTerminated),
        }
    }

    async fn submit(&self, kind: CommandKind) -> Snapshot {
        let (command, done) = Command::new(kind);

        if self.commands.send(command).await.is_err() {
            tracing::debug!(?kind, "refresh worker is gone, returning current credential");
            return self.store.read();
        }

        match done.await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                tracing::debug!(?kind, "refresh worker dropped command");
                self.store.read()
            }
        }
    }
}
