use std::sync::Arc;

use payload_codec::{CryptoContext, Opened};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::arbiter::{Directive, Grant, arbitrate};
use crate::capture::{CaptureAgent, Ensured};
use crate::session::bookmark::{self, SessionBookmark};
use crate::session::{FrameMetadata, Peer, SessionId, SessionRecord};

/// A frame from the other peer, ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFrame {
    pub source: Peer,
    /// Base64 JPEG.
    pub image: String,
    /// The payload did not decrypt and is shown as stored.
    pub legacy: bool,
    pub timestamp: i64,
    pub metadata: Option<FrameMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayFeed {
    Idle,
    /// Our own camera is the source.
    Local,
    Remote(RemoteFrame),
}

/// Capture side effect of one reconciliation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEffect {
    None,
    Started,
    Adopted,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// `None` when the snapshot was older than one already applied.
    pub directive: Option<Directive>,
    pub capture: CaptureEffect,
    pub bookmark_cleared: bool,
}

impl ReconcileOutcome {
    fn skipped() -> Self {
        Self {
            directive: None,
            capture: CaptureEffect::None,
            bookmark_cleared: false,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.directive.is_none()
    }

    /// Whether this step changed anything outside the reconciler.
    pub fn has_side_effects(&self) -> bool {
        self.capture != CaptureEffect::None || self.bookmark_cleared
    }
}

/// Drives one peer's capture agent toward whatever the latest session
/// record says. Applying the same record twice is a no-op; applying an
/// older record after a newer one is ignored.
pub struct Reconciler {
    me: Peer,
    session: SessionId,
    agent: CaptureAgent,
    crypto: Arc<CryptoContext>,
    bookmark: Option<Arc<dyn SessionBookmark>>,
    last_revision: Option<u64>,
    feed: watch::Sender<DisplayFeed>,
}

impl Reconciler {
    pub fn new(me: Peer, session: SessionId, agent: CaptureAgent, crypto: Arc<CryptoContext>) -> Self {
        let (feed, _) = watch::channel(DisplayFeed::Idle);
        Self {
            me,
            session,
            agent,
            crypto,
            bookmark: None,
            last_revision: None,
            feed,
        }
    }

    /// Bookmark to clear once the session stops for good.
    pub fn with_bookmark(mut self, bookmark: Arc<dyn SessionBookmark>) -> Self {
        self.bookmark = Some(bookmark);
        self
    }

    pub fn peer(&self) -> Peer {
        self.me
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn agent(&self) -> &CaptureAgent {
        &self.agent
    }

    pub fn feed(&self) -> watch::Receiver<DisplayFeed> {
        self.feed.subscribe()
    }

    pub fn apply(&mut self, record: &SessionRecord) -> ReconcileOutcome {
        if let Some(last) = self.last_revision {
            if record.revision < last {
                debug!(
                    target = "tandem::sync",
                    session = %self.session,
                    revision = record.revision,
                    applied = last,
                    "ignoring stale snapshot"
                );
                return ReconcileOutcome::skipped();
            }
        }
        self.last_revision = Some(record.revision);

        let directive = arbitrate(self.me, record);
        let mut outcome = ReconcileOutcome {
            directive: Some(directive),
            capture: CaptureEffect::None,
            bookmark_cleared: false,
        };

        match directive {
            Directive::Capture { epoch } => {
                let grant = Grant {
                    session: self.session.clone(),
                    peer: self.me,
                    epoch,
                };
                outcome.capture = match self.agent.ensure_running(&grant) {
                    Ensured::Started => CaptureEffect::Started,
                    Ensured::Adopted => CaptureEffect::Adopted,
                    Ensured::Unchanged => CaptureEffect::None,
                    Ensured::Failed => CaptureEffect::Failed,
                };
                if outcome.capture == CaptureEffect::Failed {
                    self.show(DisplayFeed::Idle);
                } else {
                    self.show(DisplayFeed::Local);
                }
            }
            Directive::Yield { holder } => {
                outcome.capture = self.stop_capture();
                let feed = self
                    .remote_frame(record, holder)
                    .map(DisplayFeed::Remote)
                    .unwrap_or(DisplayFeed::Idle);
                self.show(feed);
            }
            Directive::Standby | Directive::Idle => {
                outcome.capture = self.stop_capture();
                self.show(DisplayFeed::Idle);
            }
            Directive::Stop => {
                outcome.capture = self.stop_capture();
                self.show(DisplayFeed::Idle);
                outcome.bookmark_cleared = self.clear_bookmark();
            }
        }

        if outcome.has_side_effects() {
            info!(
                target = "tandem::sync",
                session = %self.session,
                peer = %self.me,
                revision = record.revision,
                directive = ?directive,
                capture = ?outcome.capture,
                "reconciled"
            );
        }
        outcome
    }

    /// The record expired or was deleted; treated as a final stop.
    pub fn session_removed(&mut self) -> ReconcileOutcome {
        info!(target = "tandem::sync", session = %self.session, "session record removed");
        let capture = self.stop_capture();
        self.show(DisplayFeed::Idle);
        ReconcileOutcome {
            directive: Some(Directive::Stop),
            capture,
            bookmark_cleared: self.clear_bookmark(),
        }
    }

    fn stop_capture(&self) -> CaptureEffect {
        if self.agent.stop() {
            CaptureEffect::Stopped
        } else {
            CaptureEffect::None
        }
    }

    fn remote_frame(&self, record: &SessionRecord, holder: Peer) -> Option<RemoteFrame> {
        let frame = record.frame.as_ref()?;
        // Frames without a source predate source tagging; trust the record.
        if frame.source.is_some_and(|source| source != holder) {
            return None;
        }
        let (image, legacy) = match frame.image.open(&self.crypto) {
            Opened::Decrypted(image) => (image, false),
            Opened::Legacy(raw) => (raw, true),
        };
        Some(RemoteFrame {
            source: holder,
            image,
            legacy,
            timestamp: frame.timestamp,
            metadata: frame.metadata.clone(),
        })
    }

    fn show(&self, feed: DisplayFeed) {
        self.feed.send_if_modified(|current| {
            if *current == feed {
                false
            } else {
                *current = feed;
                true
            }
        });
    }

    fn clear_bookmark(&self) -> bool {
        let Some(bookmark) = &self.bookmark else {
            return false;
        };
        match bookmark::clear_if_current(bookmark.as_ref(), &self.session) {
            Ok(cleared) => cleared,
            Err(err) => {
                warn!(target = "tandem::sync", session = %self.session, error = %err, "failed to clear session bookmark");
                false
            }
        }
    }
}
