use payload_codec::CodecError;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::session::SessionId;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("no live session for join code {0}")]
    SessionNotFound(SessionId),
    #[error("camera or microphone access was denied")]
    PermissionDenied,
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("control of session {session} kept changing hands; gave up after {attempts} attempts")]
    ConcurrentHandoffRace { session: SessionId, attempts: u32 },
    #[error("no longer the active source of session {session} (now at epoch {epoch})")]
    Superseded { session: SessionId, epoch: u64 },
    #[error("corrupt session record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("capture failed: {0}")]
    Capture(CaptureError),
}

impl HandoffError {
    /// Errors the user has to see and act on.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            HandoffError::SessionNotFound(_) | HandoffError::PermissionDenied
        )
    }
}

impl From<StoreError> for HandoffError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) | StoreError::Closed(id) => HandoffError::SessionNotFound(id),
            StoreError::Stale { session, epoch, .. } => HandoffError::Superseded { session, epoch },
            StoreError::Unavailable(reason) => HandoffError::StoreUnavailable(reason),
            StoreError::Corrupt(reason) => HandoffError::Corrupt(reason),
        }
    }
}

impl From<CaptureError> for HandoffError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => HandoffError::PermissionDenied,
            other => HandoffError::Capture(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ActiveSource;

    #[test]
    fn store_errors_translate_into_the_handoff_taxonomy() {
        let id = SessionId::new("ABCDEFGHJK");
        assert!(matches!(
            HandoffError::from(StoreError::Closed(id.clone())),
            HandoffError::SessionNotFound(_)
        ));
        assert!(matches!(
            HandoffError::from(StoreError::Stale {
                session: id.clone(),
                epoch: 3,
                holder: ActiveSource::Web,
            }),
            HandoffError::Superseded { epoch: 3, .. }
        ));
        assert!(matches!(
            HandoffError::from(StoreError::Unavailable("timeout".into())),
            HandoffError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn only_join_and_permission_failures_are_user_visible() {
        assert!(HandoffError::PermissionDenied.is_user_visible());
        assert!(HandoffError::SessionNotFound(SessionId::new("X")).is_user_visible());
        assert!(!HandoffError::StoreUnavailable("down".into()).is_user_visible());
        assert!(!HandoffError::from(CaptureError::Encode("bad".into())).is_user_visible());
    }
}
