use std::sync::Arc;
use std::time::Duration;

use payload_codec::CryptoContext;
use tandem_core::capture::{CaptureSettings, CaptureStatus, SyntheticCamera};
use tandem_core::session::{MemoryBookmark, SessionBookmark};
use tandem_core::store::{InMemorySessionStore, SessionStore};
use tandem_core::sync::{CaptureEffect, DisplayFeed, LinkState};
use tandem_core::{
    ActiveSource, Arbiter, CaptureAgent, Peer, Reconciler, SessionId, SessionManager, SyncHandle,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn crypto() -> Arc<CryptoContext> {
    Arc::new(CryptoContext::with_params("handoff-secret", b"handoff-salt", 1_000))
}

fn settings() -> CaptureSettings {
    CaptureSettings {
        frame_interval: Duration::from_millis(10),
        ..CaptureSettings::default()
    }
}

struct Device {
    peer: Peer,
    camera: SyntheticCamera,
    arbiter: Arbiter,
    bookmark: Arc<MemoryBookmark>,
    manager: SessionManager,
}

impl Device {
    fn new(peer: Peer, store: &Arc<InMemorySessionStore>) -> Self {
        let bookmark = Arc::new(MemoryBookmark::new());
        Self {
            peer,
            camera: SyntheticCamera::default(),
            arbiter: Arbiter::new(store.clone()),
            bookmark: bookmark.clone(),
            manager: SessionManager::new(store.clone(), bookmark),
        }
    }

    fn agent(&self, crypto: &Arc<CryptoContext>) -> CaptureAgent {
        CaptureAgent::new(
            Arc::new(self.camera.clone()),
            self.arbiter.clone(),
            crypto.clone(),
            settings(),
        )
    }

    fn reconciler(&self, session: &SessionId, crypto: &Arc<CryptoContext>) -> Reconciler {
        Reconciler::new(self.peer, session.clone(), self.agent(crypto), crypto.clone())
            .with_bookmark(self.bookmark.clone())
    }

    async fn follow(
        &self,
        store: &Arc<InMemorySessionStore>,
        session: &SessionId,
        crypto: &Arc<CryptoContext>,
    ) -> SyncHandle {
        SyncHandle::spawn(
            self.reconciler(session, crypto),
            store.subscribe(session).await.unwrap(),
        )
    }
}

#[tokio::test]
async fn mobile_joins_takes_over_and_termination_stops_both() {
    let store = InMemorySessionStore::new();
    let crypto = crypto();
    let desk = Device::new(Peer::Web, &store);
    let phone = Device::new(Peer::Mobile, &store);

    let session = desk.manager.create_session("desk-1").await.unwrap();
    let record = store.get(&session).await.unwrap();
    assert!(!record.running);
    assert_eq!(record.active_source, ActiveSource::None);
    let desk_sync = desk.follow(&store, &session, &crypto).await;

    let joined = phone
        .manager
        .verify_join_code(&session.as_str().to_ascii_lowercase())
        .await
        .unwrap();
    assert_eq!(joined, session);
    let phone_sync = phone.follow(&store, &session, &crypto).await;
    phone.arbiter.claim(&session, Peer::Mobile).await.unwrap();

    let record = store.get(&session).await.unwrap();
    assert!(record.running);
    assert_eq!(record.active_source, ActiveSource::Mobile);

    // The desktop shows the phone's frames and never opens its own camera.
    let mut desk_feed = desk_sync.feed();
    timeout(
        WAIT,
        desk_feed.wait_for(|feed| matches!(feed, DisplayFeed::Remote(frame) if frame.source == Peer::Mobile && !frame.legacy)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(desk.camera.opened(), 0);
    assert_eq!(phone.camera.in_use(), 1);

    desk.manager.terminate(&session).await.unwrap();
    timeout(WAIT, desk_sync.ended()).await.unwrap();
    timeout(WAIT, phone_sync.ended()).await.unwrap();

    let record = store.get(&session).await.unwrap();
    assert!(!record.running);
    assert_eq!(record.active_source, ActiveSource::None);
    assert!(record.frame.is_none());
    assert_eq!(phone.camera.in_use(), 0);
    assert_eq!(desk.camera.opened(), 0);
    assert_eq!(desk.bookmark.load().unwrap(), None);
    assert_eq!(phone.bookmark.load().unwrap(), None);
    assert!(phone.manager.verify_join_code(session.as_str()).await.is_err());
}

#[tokio::test]
async fn alternating_claims_never_leave_two_cameras_on() {
    let store = InMemorySessionStore::new();
    let crypto = crypto();
    let desk = Device::new(Peer::Web, &store);
    let phone = Device::new(Peer::Mobile, &store);
    let session = desk.manager.create_session("desk-1").await.unwrap();

    let mut desk_reconciler = desk.reconciler(&session, &crypto);
    let mut phone_reconciler = phone.reconciler(&session, &crypto);

    let claims = [
        Peer::Web,
        Peer::Mobile,
        Peer::Mobile,
        Peer::Web,
        Peer::Mobile,
        Peer::Web,
        Peer::Web,
    ];
    for claimant in claims {
        let (first, second) = if claimant == Peer::Web {
            (&desk.arbiter, &phone.arbiter)
        } else {
            (&phone.arbiter, &desk.arbiter)
        };
        let (a, b) = tokio::join!(
            first.claim(&session, claimant),
            second.claim(&session, claimant.other())
        );
        a.unwrap();
        b.unwrap();

        let record = store.get(&session).await.unwrap();
        let holder = record.holder().unwrap();
        desk_reconciler.apply(&record);
        phone_reconciler.apply(&record);

        let capturing = [&desk, &phone]
            .iter()
            .filter(|device| device.camera.in_use() > 0)
            .map(|device| device.peer)
            .collect::<Vec<_>>();
        assert_eq!(capturing, vec![holder]);
    }

    desk_reconciler.agent().stop();
    phone_reconciler.agent().stop();
    assert_eq!(desk.camera.in_use() + phone.camera.in_use(), 0);
}

#[tokio::test]
async fn redelivered_state_has_no_further_effect() {
    let store = InMemorySessionStore::new();
    let crypto = crypto();
    let phone = Device::new(Peer::Mobile, &store);
    let session = phone.manager.create_session("desk-1").await.unwrap();
    phone.arbiter.claim(&session, Peer::Mobile).await.unwrap();

    let mut reconciler = phone.reconciler(&session, &crypto);
    let record = store.get(&session).await.unwrap();
    assert_eq!(reconciler.apply(&record).capture, CaptureEffect::Started);
    let again = reconciler.apply(&record);
    assert!(!again.has_side_effects());
    assert_eq!(phone.camera.opened(), 1);
    reconciler.agent().stop();
}

#[tokio::test]
async fn denied_camera_is_reported_and_not_retried() {
    let store = InMemorySessionStore::new();
    let crypto = crypto();
    let phone = Device::new(Peer::Mobile, &store);
    phone.camera.deny_permission(true);
    let session = phone.manager.create_session("desk-1").await.unwrap();
    phone.arbiter.claim(&session, Peer::Mobile).await.unwrap();

    let mut reconciler = phone.reconciler(&session, &crypto);
    let status = reconciler.agent().status();
    let record = store.get(&session).await.unwrap();
    assert_eq!(reconciler.apply(&record).capture, CaptureEffect::Failed);
    assert!(matches!(*status.borrow(), CaptureStatus::Failed(_)));

    reconciler.apply(&record);
    assert_eq!(phone.camera.opened(), 0);
    assert!(!reconciler.agent().is_running());
}

#[tokio::test]
async fn expired_session_ends_the_link() {
    let store = InMemorySessionStore::new();
    let crypto = crypto();
    let desk = Device::new(Peer::Web, &store);
    let session = desk.manager.create_session("desk-1").await.unwrap();
    let sync = desk.follow(&store, &session, &crypto).await;

    store.expire(&session);
    timeout(WAIT, sync.ended()).await.unwrap();
    assert_eq!(*sync.link().borrow(), LinkState::Ended);
    assert_eq!(desk.bookmark.load().unwrap(), None);
}
