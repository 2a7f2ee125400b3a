//! Session lifecycle: creating sessions, verifying join codes, toggling
//! running/active source, termination, and the local rejoin bookmark.

pub mod bookmark;
pub mod join_code;
mod record;

use std::sync::Arc;

use tracing::{debug, info, warn};

pub use self::bookmark::{BookmarkError, FileBookmark, MemoryBookmark, SessionBookmark};
pub use self::record::{
    ActiveSource, Frame, FrameMetadata, PatchError, Peer, Precondition, SessionId, SessionPatch,
    SessionRecord, now_millis,
};

use crate::error::HandoffError;
use crate::store::{NewSession, SharedStore, StoreError};

#[derive(Clone)]
pub struct SessionManager {
    store: SharedStore,
    bookmark: Arc<dyn SessionBookmark>,
}

impl SessionManager {
    pub fn new(store: SharedStore, bookmark: Arc<dyn SessionBookmark>) -> Self {
        Self { store, bookmark }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn bookmark(&self) -> &Arc<dyn SessionBookmark> {
        &self.bookmark
    }

    /// Allocates a new, not-yet-running session. Only the desktop host calls this.
    pub async fn create_session(&self, host_id: &str) -> Result<SessionId, HandoffError> {
        let record = self
            .store
            .create(NewSession {
                host_id: host_id.to_string(),
            })
            .await?;
        info!(
            target = "tandem::session",
            session = %record.id,
            host = %host_id,
            "session created"
        );
        self.remember(&record.id);
        Ok(record.id)
    }

    /// Resolves user input to a live session id.
    ///
    /// Anything that cannot be an id is rejected without a store round trip.
    /// Closed sessions are reported as not found: the code is a capability
    /// that dies with the session.
    pub async fn verify_join_code(&self, code: &str) -> Result<SessionId, HandoffError> {
        let Some(id) = join_code::normalize(code) else {
            debug!(target = "tandem::session", input = %code, "rejected malformed join code");
            return Err(HandoffError::SessionNotFound(SessionId::new(code.trim())));
        };
        let record = self.store.get(&id).await?;
        if record.closed {
            return Err(HandoffError::SessionNotFound(id));
        }
        info!(target = "tandem::session", session = %id, "join code verified");
        self.remember(&id);
        Ok(id)
    }

    pub async fn set_running(
        &self,
        id: &SessionId,
        running: bool,
    ) -> Result<SessionRecord, HandoffError> {
        let record = self.store.update(id, SessionPatch::running(running)).await?;
        debug!(target = "tandem::session", session = %id, running, "running flag set");
        Ok(record)
    }

    /// Unconditional source switch. Peers that need fencing go through the arbiter.
    pub async fn set_active_source(
        &self,
        id: &SessionId,
        source: ActiveSource,
    ) -> Result<SessionRecord, HandoffError> {
        let record = self
            .store
            .update(id, SessionPatch::active_source(source))
            .await?;
        debug!(
            target = "tandem::session",
            session = %id,
            source = %source,
            epoch = record.epoch,
            "active source set"
        );
        Ok(record)
    }

    /// Stops and closes the session. Terminating a closed session is a no-op.
    pub async fn terminate(&self, id: &SessionId) -> Result<SessionRecord, HandoffError> {
        let record = self.store.update(id, SessionPatch::terminate()).await?;
        info!(target = "tandem::session", session = %id, "session terminated");
        self.forget(id);
        Ok(record)
    }

    pub async fn snapshot(&self, id: &SessionId) -> Result<SessionRecord, HandoffError> {
        Ok(self.store.get(id).await?)
    }

    /// Re-verifies the bookmarked session, dropping the bookmark if the
    /// session has gone away.
    pub async fn resume_last(&self) -> Result<Option<SessionId>, HandoffError> {
        let id = match self.bookmark.load() {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(target = "tandem::session", error = %err, "unreadable session bookmark");
                return Ok(None);
            }
        };

        match self.store.get(&id).await {
            Ok(record) if !record.closed => Ok(Some(id)),
            Ok(_) | Err(StoreError::NotFound(_)) | Err(StoreError::Closed(_)) => {
                info!(target = "tandem::session", session = %id, "bookmarked session is gone");
                self.forget(&id);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Clears the bookmark if it still names `id`.
    pub fn forget(&self, id: &SessionId) {
        if let Err(err) = bookmark::clear_if_current(self.bookmark.as_ref(), id) {
            warn!(target = "tandem::session", session = %id, error = %err, "failed to clear session bookmark");
        }
    }

    fn remember(&self, id: &SessionId) {
        if let Err(err) = self.bookmark.save(id) {
            warn!(target = "tandem::session", session = %id, error = %err, "failed to save session bookmark");
        }
    }
}
