//! Keeps local capture in line with the shared session record.

pub mod reconciler;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use self::reconciler::{CaptureEffect, DisplayFeed, ReconcileOutcome, Reconciler, RemoteFrame};

use crate::capture::CaptureAgent;
use crate::session::SessionId;
use crate::store::{SessionEvent, SessionSubscription};

/// State of the change feed as seen by one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Live,
    /// The store is unreachable; the last applied state stays in effect.
    Unavailable(String),
    /// The session was closed or removed, or the feed ended.
    Ended,
}

/// Running reconciliation for one peer. Dropping it stops capture.
pub struct SyncHandle {
    session: SessionId,
    agent: CaptureAgent,
    feed: watch::Receiver<DisplayFeed>,
    link: watch::Receiver<LinkState>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn spawn(reconciler: Reconciler, subscription: SessionSubscription) -> Self {
        let session = reconciler.session().clone();
        let agent = reconciler.agent().clone();
        let feed = reconciler.feed();
        let (link_tx, link) = watch::channel(LinkState::Live);
        let task = tokio::spawn(drive(reconciler, subscription, link_tx));
        Self {
            session,
            agent,
            feed,
            link,
            task: Some(task),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn feed(&self) -> watch::Receiver<DisplayFeed> {
        self.feed.clone()
    }

    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Resolves once the session is over for this peer.
    pub async fn ended(&self) {
        let mut link = self.link.clone();
        let _ = link.wait_for(|state| *state == LinkState::Ended).await;
    }

    /// Stops capture, releasing the device, then tears down the subscription.
    pub fn leave(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.agent.stop();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(target = "tandem::sync", session = %self.session, "left session");
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drive(
    mut reconciler: Reconciler,
    mut subscription: SessionSubscription,
    link: watch::Sender<LinkState>,
) {
    while let Some(event) = subscription.next().await {
        match event {
            SessionEvent::Snapshot(record) => {
                reconciler.apply(&record);
                if record.closed {
                    info!(target = "tandem::sync", session = %reconciler.session(), "session closed");
                    break;
                }
                link.send_if_modified(|state| {
                    if *state == LinkState::Live {
                        false
                    } else {
                        *state = LinkState::Live;
                        true
                    }
                });
            }
            SessionEvent::Unavailable(reason) => {
                warn!(
                    target = "tandem::sync",
                    session = %reconciler.session(),
                    error = %reason,
                    "session feed unavailable; keeping last state"
                );
                link.send_replace(LinkState::Unavailable(reason));
            }
            SessionEvent::Removed => {
                reconciler.session_removed();
                break;
            }
        }
    }
    reconciler.agent().stop();
    link.send_replace(LinkState::Ended);
}
