use std::{error, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};

use crate::{
    credential::Token,
    issuer::{CredentialIssuer, IssuedToken, IssuerError},
    store::{Snapshot, TokenStore},
    AccessToken, Credential, CredentialError,
};

/// What a caller wants the worker to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Refresh,
    Invalidate,
    Stop,
}

/// A request to the worker, answered with the snapshot that reflects it
#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) kind: CommandKind,
    pub(crate) done: oneshot::Sender<Snapshot>,
}

impl Command {
    pub(crate) fn new(kind: CommandKind) -> (Self, oneshot::Receiver<Snapshot>) {
        let (done, rx) = oneshot::channel();
        (Self { kind, done }, rx)
    }
}

#[derive(Debug)]
enum State {
    Bootstrapping,
    Active {
        access_token: AccessToken,
        refresh_at: Instant,
    },
    Failed,
    Stopped,
}

/// Owns the issuer and every call made against it
///
/// The worker is the only writer of the token store. It runs until it is
/// stopped or every handle to its command queue has been dropped.
pub(crate) struct RefreshWorker<I> {
    issuer: I,
    store: Arc<TokenStore>,
    commands: mpsc::Receiver<Command>,
    margin: Duration,
    state: State,
}

impl<I: CredentialIssuer> RefreshWorker<I> {
    pub(crate) fn new(
        issuer: I,
        store: Arc<TokenStore>,
        commands: mpsc::Receiver<Command>,
        margin: Duration,
    ) -> Self {
        Self {
            issuer,
            store,
            commands,
            margin,
            state: State::Bootstrapping,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let command = match &self.state {
                State::Bootstrapping => {
                    tracing::debug!("requesting initial token");
                    self.fetch(CredentialError::Fetch).await;
                    continue;
                }
                State::Active { refresh_at, .. } => {
                    let refresh_at = *refresh_at;
                    tokio::select! {
                        biased;
                        command = self.commands.recv() => command,
                        () = time::sleep_until(refresh_at) => {
                            tracing::debug!("token due for renewal, refreshing");
                            self.refresh().await;
                            continue;
                        }
                    }
                }
                State::Failed => self.commands.recv().await,
                State::Stopped => break,
            };

            let Some(command) = command else {
                tracing::info!("all token cache handles dropped, halting refresh worker");
                return;
            };

            let snapshot = self.handle(command.kind).await;
            if command.done.send(snapshot).is_err() {
                tracing::trace!(kind = ?command.kind, "caller stopped waiting for command");
            }
        }

        self.reject_pending().await;
        tracing::info!("refresh worker stopped");
    }

    async fn handle(&mut self, kind: CommandKind) -> Snapshot {
        tracing::debug!(?kind, "handling command");

        match (kind, &self.state) {
            (CommandKind::Refresh, State::Active { .. }) => self.refresh().await,
            (CommandKind::Refresh, _) => self.fetch(CredentialError::Fetch).await,
            (CommandKind::Invalidate, State::Active { .. }) => self.invalidate().await,
            (CommandKind::Invalidate, _) => {
                tracing::debug!("credential already invalidated, nothing to revoke");
                self.store.read()
            }
            (CommandKind::Stop, _) => self.stop().await,
        }
    }

    /// Fetches a new token from scratch
    ///
    /// On failure, the fetch error is wrapped with `on_error` and published.
    async fn fetch(&mut self, on_error: fn(IssuerError) -> CredentialError) -> Snapshot {
        let result = self.issuer.fetch().await;
        self.publish_issued(result, on_error)
    }

    async fn refresh(&mut self) -> Snapshot {
        let result = match &self.state {
            State::Active { access_token, .. } => self.issuer.refresh(access_token).await,
            _ => self.issuer.fetch().await,
        };
        self.publish_issued(result, CredentialError::Refresh)
    }

    async fn invalidate(&mut self) -> Snapshot {
        let error = match self.revoke_current().await {
            Some(Err(error)) => CredentialError::Revoke(error),
            _ => CredentialError::Revoked,
        };

        self.state = State::Failed;
        self.store.publish(Credential::invalidated(error))
    }

    async fn stop(&mut self) -> Snapshot {
        let revoke_error = self.revoke_current().await.and_then(Result::err);

        self.state = State::Stopped;
        let snapshot = self
            .store
            .publish(Credential::invalidated(CredentialError::Stopped { revoke_error }));

        // Callers that can no longer enqueue read the store instead, so it
        // must already hold the stopped credential.
        self.commands.close();
        snapshot
    }

    /// Revokes the current token if there is one
    ///
    /// Returns `None` if there was nothing valid to revoke. The token leaves
    /// the worker's hands either way, so it is never revoked twice.
    async fn revoke_current(&mut self) -> Option<Result<(), IssuerError>> {
        let State::Active { access_token, .. } =
            std::mem::replace(&mut self.state, State::Failed)
        else {
            return None;
        };

        tracing::debug!("revoking current token");
        let result = self.issuer.revoke(&access_token).await;
        match &result {
            Ok(()) => tracing::info!("token revoked"),
            Err(error) => tracing::warn!(
                error = (error as &dyn error::Error),
                "error revoking token"
            ),
        }

        Some(result)
    }

    fn publish_issued(
        &mut self,
        result: Result<IssuedToken, IssuerError>,
        on_error: fn(IssuerError) -> CredentialError,
    ) -> Snapshot {
        let margin = self.margin;
        let issued = result
            .and_then(validate)
            .and_then(|issued| Token::issue(issued, margin, Instant::now()));

        match issued {
            Ok(token) => {
                tracing::info!(
                    lifetime = token.lifetime().as_secs(),
                    refresh_in = token.refresh_at().duration_since(token.issued()).as_secs(),
                    "received new token"
                );

                self.state = State::Active {
                    access_token: token.access_token().to_owned(),
                    refresh_at: token.refresh_at(),
                };
                self.store.publish(Credential::valid(token))
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "error requesting token, waiting for an explicit refresh"
                );

                self.state = State::Failed;
                self.store.publish(Credential::invalidated(on_error(error)))
            }
        }
    }

    /// Answers every command still queued behind a stop
    async fn reject_pending(&mut self) {
        self.commands.close();

        while let Some(command) = self.commands.recv().await {
            tracing::debug!(kind = ?command.kind, "rejecting command, worker has stopped");
            let _ = command.done.send(self.store.read());
        }
    }
}

fn validate(issued: IssuedToken) -> Result<IssuedToken, IssuerError> {
    if issued.access_token.as_str().is_empty() {
        Err(IssuerError::MalformedResponse(
            "issued access token is empty".to_owned(),
        ))
    } else if issued.expires_in.is_zero() {
        Err(IssuerError::MalformedResponse(
            "issued token has no lifetime".to_owned(),
        ))
    } else {
        Ok(issued)
    }
}
