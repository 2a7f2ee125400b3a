//! Who gets to produce frames for a session.
//!
//! Producer rights are recorded in the session's `active_source`, guarded by
//! the record's `epoch`. A claim is a conditional write on the epoch the
//! claimant last saw; frame pushes are conditional on the claimant still
//! holding that epoch, so a peer that lost a race cannot overwrite the
//! winner's frames.

use tracing::{debug, info, warn};

use crate::error::HandoffError;
use crate::session::{ActiveSource, Frame, Peer, SessionId, SessionPatch, SessionRecord};
use crate::store::{SharedStore, StoreError};

pub const DEFAULT_MAX_CLAIM_ATTEMPTS: u32 = 3;

/// Producer rights for one session at one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub session: SessionId,
    pub peer: Peer,
    pub epoch: u64,
}

/// What a peer should be doing given a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// This peer holds the session at `epoch`.
    Capture { epoch: u64 },
    /// The other peer holds it.
    Yield { holder: Peer },
    /// Running without a holder; a transient state between writes.
    Standby,
    /// Created but never started.
    Idle,
    /// Stopped after a run, or closed.
    Stop,
}

pub fn arbitrate(me: Peer, record: &SessionRecord) -> Directive {
    if record.closed {
        return Directive::Stop;
    }
    if !record.running {
        return if record.epoch == 0 {
            Directive::Idle
        } else {
            Directive::Stop
        };
    }
    match record.active_source {
        ActiveSource::None => Directive::Standby,
        source if source == ActiveSource::from(me) => Directive::Capture {
            epoch: record.epoch,
        },
        _ => Directive::Yield { holder: me.other() },
    }
}

#[derive(Clone)]
pub struct Arbiter {
    store: SharedStore,
    max_claim_attempts: u32,
}

impl Arbiter {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
        }
    }

    pub fn with_max_claim_attempts(mut self, attempts: u32) -> Self {
        self.max_claim_attempts = attempts.max(1);
        self
    }

    /// Takes producer rights for `me`.
    ///
    /// Returns the existing grant if `me` already holds the session. Claims
    /// that lose to a concurrent writer re-read and retry; running out of
    /// attempts yields [`HandoffError::ConcurrentHandoffRace`].
    pub async fn claim(&self, session: &SessionId, me: Peer) -> Result<Grant, HandoffError> {
        let mut observed = self.store.get(session).await?;
        for attempt in 1..=self.max_claim_attempts {
            if observed.closed {
                return Err(HandoffError::SessionNotFound(session.clone()));
            }
            if observed.holder() == Some(me) {
                debug!(
                    target = "tandem::arbiter",
                    session = %session,
                    peer = %me,
                    epoch = observed.epoch,
                    "already holding session"
                );
                return Ok(grant(session, me, observed.epoch));
            }

            match self
                .store
                .update(session, SessionPatch::claim(me, observed.epoch))
                .await
            {
                Ok(record) => {
                    info!(
                        target = "tandem::arbiter",
                        session = %session,
                        peer = %me,
                        epoch = record.epoch,
                        attempt,
                        "claimed session"
                    );
                    return Ok(grant(session, me, record.epoch));
                }
                Err(StoreError::Stale { epoch, holder, .. }) => {
                    debug!(
                        target = "tandem::arbiter",
                        session = %session,
                        peer = %me,
                        epoch,
                        holder = %holder,
                        attempt,
                        "claim lost a race; re-reading"
                    );
                    observed = self.store.get(session).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            target = "tandem::arbiter",
            session = %session,
            peer = %me,
            attempts = self.max_claim_attempts,
            "gave up claiming session"
        );
        Err(HandoffError::ConcurrentHandoffRace {
            session: session.clone(),
            attempts: self.max_claim_attempts,
        })
    }

    /// Writes `frame` if `grant` is still current.
    pub async fn push_frame(&self, grant: &Grant, frame: Frame) -> Result<SessionRecord, HandoffError> {
        let patch = SessionPatch::frame(grant.peer, grant.epoch, frame);
        match self.store.update(&grant.session, patch).await {
            Ok(record) => Ok(record),
            Err(StoreError::Stale { epoch, holder, .. }) => {
                debug!(
                    target = "tandem::arbiter",
                    session = %grant.session,
                    peer = %grant.peer,
                    grant_epoch = grant.epoch,
                    epoch,
                    holder = %holder,
                    "frame write fenced"
                );
                Err(HandoffError::Superseded {
                    session: grant.session.clone(),
                    epoch,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn grant(session: &SessionId, peer: Peer, epoch: u64) -> Grant {
    Grant {
        session: session.clone(),
        peer,
        epoch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemorySessionStore, NewSession, SessionStore};
    use payload_codec::Sealed;

    async fn setup() -> (std::sync::Arc<InMemorySessionStore>, Arbiter, SessionId) {
        let store = InMemorySessionStore::new();
        let id = store
            .create(NewSession {
                host_id: "desk-1".into(),
            })
            .await
            .unwrap()
            .id;
        let arbiter = Arbiter::new(store.clone());
        (store, arbiter, id)
    }

    fn frame(grant: &Grant) -> Frame {
        Frame {
            image: Sealed::Plaintext("aGk=".into()),
            timestamp: 1,
            metadata: None,
            source: Some(grant.peer),
            epoch: grant.epoch,
        }
    }

    #[test]
    fn arbitration_covers_every_state() {
        let mut record = SessionRecord::allocate(SessionId::new("ABCDEFGHJK"), "desk", 0);
        assert_eq!(arbitrate(Peer::Web, &record), Directive::Idle);

        record
            .apply(&SessionPatch::claim(Peer::Mobile, 0), 1)
            .unwrap();
        assert_eq!(
            arbitrate(Peer::Mobile, &record),
            Directive::Capture { epoch: 1 }
        );
        assert_eq!(
            arbitrate(Peer::Web, &record),
            Directive::Yield {
                holder: Peer::Mobile
            }
        );

        record.active_source = ActiveSource::None;
        assert_eq!(arbitrate(Peer::Web, &record), Directive::Standby);

        record.apply(&SessionPatch::running(false), 2).unwrap();
        assert_eq!(arbitrate(Peer::Web, &record), Directive::Stop);

        let mut closed = SessionRecord::allocate(SessionId::new("ABCDEFGHJK"), "desk", 0);
        closed.apply(&SessionPatch::terminate(), 1).unwrap();
        assert_eq!(arbitrate(Peer::Mobile, &closed), Directive::Stop);
    }

    #[tokio::test]
    async fn claim_is_idempotent_for_the_holder() {
        let (_, arbiter, id) = setup().await;
        let first = arbiter.claim(&id, Peer::Mobile).await.unwrap();
        let second = arbiter.claim(&id, Peer::Mobile).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.epoch, 1);
    }

    #[tokio::test]
    async fn sequential_claims_hand_over_and_fence_the_loser() {
        let (store, arbiter, id) = setup().await;
        let web = arbiter.claim(&id, Peer::Web).await.unwrap();
        arbiter.push_frame(&web, frame(&web)).await.unwrap();

        let mobile = arbiter.claim(&id, Peer::Mobile).await.unwrap();
        assert_eq!(mobile.epoch, web.epoch + 1);

        let err = arbiter.push_frame(&web, frame(&web)).await.unwrap_err();
        assert!(matches!(err, HandoffError::Superseded { epoch: 2, .. }));

        arbiter.push_frame(&mobile, frame(&mobile)).await.unwrap();
        let record = store.get(&id).await.unwrap();
        assert_eq!(record.holder(), Some(Peer::Mobile));
        assert_eq!(record.frame.and_then(|f| f.source), Some(Peer::Mobile));
    }

    #[tokio::test]
    async fn concurrent_claims_converge_on_one_holder() {
        let (store, arbiter, id) = setup().await;
        let (web, mobile) = tokio::join!(
            arbiter.claim(&id, Peer::Web),
            arbiter.claim(&id, Peer::Mobile)
        );
        let web = web.unwrap();
        let mobile = mobile.unwrap();

        let record = store.get(&id).await.unwrap();
        let holder = record.holder().unwrap();
        let (winner, loser) = if holder == Peer::Web {
            (web, mobile)
        } else {
            (mobile, web)
        };
        assert_eq!(winner.epoch, record.epoch);
        assert!(arbiter.push_frame(&loser, frame(&loser)).await.is_err());
        assert!(arbiter.push_frame(&winner, frame(&winner)).await.is_ok());
    }

    #[tokio::test]
    async fn claiming_a_closed_session_fails() {
        let (store, arbiter, id) = setup().await;
        store.update(&id, SessionPatch::terminate()).await.unwrap();
        assert!(matches!(
            arbiter.claim(&id, Peer::Web).await,
            Err(HandoffError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn outages_surface_as_store_unavailable() {
        let (store, arbiter, id) = setup().await;
        store.set_unavailable(true);
        assert!(matches!(
            arbiter.claim(&id, Peer::Web).await,
            Err(HandoffError::StoreUnavailable(_))
        ));
    }
}
