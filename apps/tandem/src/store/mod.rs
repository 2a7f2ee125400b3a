//! Client side of the shared session document store.
//!
//! The store is an external collaborator: a mutable record per session plus
//! change notification. Adapters translate their transport failures into
//! [`StoreError`] here so nothing above this module sees redis or network types.

pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::{ActiveSource, PatchError, SessionId, SessionPatch, SessionRecord};

pub use self::memory::InMemorySessionStore;
pub use self::redis_store::RedisSessionStore;

pub type SharedStore = Arc<dyn SessionStore>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("write to session {session} fenced: record is at epoch {epoch}, held by {holder}")]
    Stale {
        session: SessionId,
        epoch: u64,
        holder: ActiveSource,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn from_patch(session: &SessionId, err: PatchError) -> Self {
        match err {
            PatchError::Closed => StoreError::Closed(session.clone()),
            PatchError::Stale { epoch, holder } => StoreError::Stale {
                session: session.clone(),
                epoch,
                holder,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub host_id: String,
}

/// What a subscriber sees. Only the latest state is kept; intermediate
/// snapshots may be skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Snapshot(SessionRecord),
    /// The notification channel is down and being retried.
    Unavailable(String),
    /// The record expired or was deleted.
    Removed,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a record; the store issues the id.
    async fn create(&self, session: NewSession) -> Result<SessionRecord, StoreError>;

    async fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError>;

    /// Applies `patch` atomically, honoring its precondition.
    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<SessionRecord, StoreError>;

    async fn subscribe(&self, id: &SessionId) -> Result<SessionSubscription, StoreError>;
}

/// Stream of session snapshots. Dropping it cancels the subscription.
pub struct SessionSubscription {
    rx: watch::Receiver<SessionEvent>,
    primed: bool,
    _pump: Option<AbortOnDrop>,
}

impl SessionSubscription {
    pub fn new(rx: watch::Receiver<SessionEvent>) -> Self {
        Self {
            rx,
            primed: false,
            _pump: None,
        }
    }

    /// Ties a background task feeding `rx` to the subscription's lifetime.
    pub fn with_pump(rx: watch::Receiver<SessionEvent>, pump: JoinHandle<()>) -> Self {
        Self {
            rx,
            primed: false,
            _pump: Some(AbortOnDrop(pump)),
        }
    }

    /// Yields the current state first, then every newer state. `None` once the
    /// store side has gone away.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn latest(&self) -> SessionEvent {
        self.rx.borrow().clone()
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Bounded exponential backoff for store reconnects.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}
