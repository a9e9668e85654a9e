use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    issuer::{CredentialIssuer, IssuedToken, IssuerError},
    AccessTokenRef,
};

/// A scripted response from the fake issuer
#[derive(Debug)]
pub enum Scripted {
    Token(String, Duration),
    Error(IssuerError),
}

impl Scripted {
    pub fn token(access_token: &str, expires_in_secs: u64) -> Self {
        Self::Token(
            access_token.to_owned(),
            Duration::from_secs(expires_in_secs),
        )
    }

    pub fn transport_error(message: &str) -> Self {
        Self::Error(IssuerError::transport(io::Error::other(message.to_owned())))
    }

    pub fn rejected(error: &str) -> Self {
        Self::Error(IssuerError::Rejected {
            error: error.to_owned(),
            description: None,
        })
    }

    fn into_result(self) -> Result<IssuedToken, IssuerError> {
        match self {
            Self::Token(access_token, expires_in) => Ok(IssuedToken::new(access_token, expires_in)),
            Self::Error(error) => Err(error),
        }
    }
}

/// Everything the fake issuer was asked to do
#[derive(Debug, Default)]
pub struct CallLog {
    fetches: AtomicUsize,
    refreshes: Mutex<Vec<String>>,
    revokes: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CallLog {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> Vec<String> {
        self.refreshes.lock().unwrap().clone()
    }

    pub fn revokes(&self) -> Vec<String> {
        self.revokes.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An issuer that replays scripted responses and records every call
#[derive(Debug, Default)]
pub struct FakeIssuer {
    fetch: VecDeque<Scripted>,
    refresh: VecDeque<Scripted>,
    revoke: VecDeque<Result<(), IssuerError>>,
    latency: Duration,
    calls: Arc<CallLog>,
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fetch(mut self, response: Scripted) -> Self {
        self.fetch.push_back(response);
        self
    }

    pub fn on_refresh(mut self, response: Scripted) -> Self {
        self.refresh.push_back(response);
        self
    }

    pub fn on_revoke(mut self, response: Result<(), IssuerError>) -> Self {
        self.revoke.push_back(response);
        self
    }

    /// Makes every call take `latency` to complete
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Arc<CallLog> {
        Arc::clone(&self.calls)
    }

    async fn in_flight<T>(&self, respond: impl FnOnce() -> T) -> T {
        self.calls.enter();
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        let response = respond();
        self.calls.exit();
        response
    }
}

fn unscripted(call: &str) -> IssuerError {
    IssuerError::MalformedResponse(format!("no {} response scripted", call))
}

#[async_trait]
impl CredentialIssuer for FakeIssuer {
    async fn fetch(&mut self) -> Result<IssuedToken, IssuerError> {
        self.calls.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.fetch.pop_front();
        self.in_flight(move || next.map_or_else(|| Err(unscripted("fetch")), Scripted::into_result))
            .await
    }

    async fn refresh(&mut self, current: &AccessTokenRef) -> Result<IssuedToken, IssuerError> {
        self.calls
            .refreshes
            .lock()
            .unwrap()
            .push(current.as_str().to_owned());
        let next = self.refresh.pop_front();
        self.in_flight(move || next.map_or_else(|| Err(unscripted("refresh")), Scripted::into_result))
            .await
    }

    async fn revoke(&mut self, token: &AccessTokenRef) -> Result<(), IssuerError> {
        self.calls
            .revokes
            .lock()
            .unwrap()
            .push(token.as_str().to_owned());
        let next = self.revoke.pop_front();
        self.in_flight(move || next.unwrap_or(Ok(()))).await
    }
}
