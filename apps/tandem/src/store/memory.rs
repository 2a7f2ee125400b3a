use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{NewSession, SessionEvent, SessionStore, SessionSubscription, StoreError};
use crate::session::{SessionId, SessionPatch, SessionRecord, join_code, now_millis};

struct Entry {
    record: SessionRecord,
    notify: watch::Sender<SessionEvent>,
}

/// In-memory adapter for tests and single-process wiring.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    unavailable: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drops a record as if it had expired.
    pub fn expire(&self, id: &SessionId) -> bool {
        match self.sessions.lock().remove(id) {
            Some(entry) => {
                entry.notify.send_replace(SessionEvent::Removed);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        self.check_available()?;
        let mut sessions = self.sessions.lock();
        let id = loop {
            let candidate = join_code::generate();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let record = SessionRecord::allocate(id.clone(), session.host_id, now_millis());
        let (notify, _) = watch::channel(SessionEvent::Snapshot(record.clone()));
        sessions.insert(
            id,
            Entry {
                record: record.clone(),
                notify,
            },
        );
        Ok(record)
    }

    async fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.check_available()?;
        self.sessions
            .lock()
            .get(id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<SessionRecord, StoreError> {
        self.check_available()?;
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut next = entry.record.clone();
        let changed = next
            .apply(&patch, now_millis())
            .map_err(|err| StoreError::from_patch(id, err))?;
        if changed {
            entry.record = next;
            entry
                .notify
                .send_replace(SessionEvent::Snapshot(entry.record.clone()));
        }
        Ok(entry.record.clone())
    }

    async fn subscribe(&self, id: &SessionId) -> Result<SessionSubscription, StoreError> {
        self.check_available()?;
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(SessionSubscription::new(entry.notify.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Peer;

    fn new_session() -> NewSession {
        NewSession {
            host_id: "desk-1".into(),
        }
    }

    #[tokio::test]
    async fn creates_and_reads_back_records() {
        let store = InMemorySessionStore::new();
        let created = store.create(new_session()).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(created, fetched);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_sessions_are_not_found() {
        let store = InMemorySessionStore::new();
        let id = SessionId::new("ZZZZZZZZZZ");
        assert_eq!(store.get(&id).await, Err(StoreError::NotFound(id.clone())));
        assert!(store.subscribe(&id).await.is_err());
    }

    #[tokio::test]
    async fn conditional_update_loses_to_a_newer_epoch() {
        let store = InMemorySessionStore::new();
        let id = store.create(new_session()).await.unwrap().id;
        store
            .update(&id, SessionPatch::claim(Peer::Web, 0))
            .await
            .unwrap();
        let err = store
            .update(&id, SessionPatch::claim(Peer::Mobile, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Stale { epoch: 1, .. }));
    }

    #[tokio::test]
    async fn subscribers_see_the_latest_state() {
        let store = InMemorySessionStore::new();
        let id = store.create(new_session()).await.unwrap().id;
        let mut subscription = store.subscribe(&id).await.unwrap();
        assert!(matches!(
            subscription.next().await,
            Some(SessionEvent::Snapshot(record)) if !record.running
        ));

        store
            .update(&id, SessionPatch::claim(Peer::Mobile, 0))
            .await
            .unwrap();
        store.update(&id, SessionPatch::terminate()).await.unwrap();

        match subscription.next().await {
            Some(SessionEvent::Snapshot(record)) => assert!(record.closed),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_op_writes_do_not_notify() {
        let store = InMemorySessionStore::new();
        let id = store.create(new_session()).await.unwrap().id;
        store.update(&id, SessionPatch::terminate()).await.unwrap();
        let mut subscription = store.subscribe(&id).await.unwrap();
        subscription.next().await.unwrap();

        store.update(&id, SessionPatch::terminate()).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), subscription.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = InMemorySessionStore::new();
        let id = store.create(new_session()).await.unwrap().id;
        store.set_unavailable(true);
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn expiry_is_reported_to_subscribers() {
        let store = InMemorySessionStore::new();
        let id = store.create(new_session()).await.unwrap().id;
        let mut subscription = store.subscribe(&id).await.unwrap();
        subscription.next().await.unwrap();
        assert!(store.expire(&id));
        assert_eq!(subscription.next().await, Some(SessionEvent::Removed));
        assert_eq!(subscription.next().await, None);
    }
}
