//! The shared cell holding the current credential

use std::{fmt, sync::Arc};

use tokio::sync::watch;

use crate::{Credential, CredentialError};

/// Marks each credential published by a token cache
///
/// Generations increase by exactly one with every published credential, so a
/// caller holding a generation can tell whether anything has happened since.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// The generation of the placeholder held before the first fetch completes
    pub const INITIAL: Self = Self(0);

    /// Gets the raw counter value
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A credential along with the generation at which it was published
#[derive(Clone, Debug)]
pub struct Snapshot {
    credential: Arc<Credential>,
    generation: Generation,
}

impl Snapshot {
    /// Gets the credential
    #[inline]
    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    /// Gets the generation at which the credential was published
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Discards the generation, keeping the credential
    #[inline]
    pub fn into_credential(self) -> Arc<Credential> {
        self.credential
    }
}

/// Holds exactly one credential and notifies waiters when it is replaced
///
/// Reads never wait on anything but the short internal lock. The credential
/// and its generation are always updated together under that lock, and
/// waiters check the generation under it as well, so a publish cannot slip
/// between a waiter's check and its sleep.
#[derive(Debug)]
pub(crate) struct TokenStore {
    tx: watch::Sender<Snapshot>,
}

impl TokenStore {
    pub(crate) fn new() -> Self {
        let placeholder = Snapshot {
            credential: Arc::new(Credential::invalidated(CredentialError::Initializing)),
            generation: Generation::INITIAL,
        };

        let (tx, _) = watch::channel(placeholder);
        Self { tx }
    }

    /// Gets the current snapshot
    pub(crate) fn read(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    /// Replaces the current credential and wakes all waiters
    pub(crate) fn publish(&self, credential: Credential) -> Snapshot {
        let credential = Arc::new(credential);
        let mut published = None;

        self.tx.send_modify(|current| {
            current.credential = credential;
            current.generation = current.generation.next();
            published = Some(current.clone());
        });

        let published = published.unwrap_or_else(|| self.read());

        tracing::trace!(
            generation = published.generation.get(),
            valid = published.credential.is_valid(),
            "published credential"
        );

        published
    }

    /// Waits until the stored generation differs from `since`
    ///
    /// Returns immediately if it already does.
    pub(crate) async fn wait_for_change(&self, since: Generation) -> Snapshot {
        let mut rx = self.tx.subscribe();
        let changed = rx
            .wait_for(|current| current.generation != since)
            .await
            .map(|current| current.clone());

        // The sender lives as long as `self`, so the channel cannot close
        // while we wait on it.
        changed.unwrap_or_else(|_| self.read())
    }
}
