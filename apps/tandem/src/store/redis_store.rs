use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{
    NewSession, RetryPolicy, SessionEvent, SessionStore, SessionSubscription, StoreError,
};
use crate::session::{SessionId, SessionPatch, SessionRecord, join_code, now_millis};

const MAX_CAS_ATTEMPTS: usize = 8;
const MAX_ALLOCATION_ATTEMPTS: usize = 5;

/// Replaces the record only if its revision is still the one we read, then
/// announces the new revision on the change channel.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
local decoded = cjson.decode(current)
local revision = tonumber(decoded['revision']) or 0
if revision ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
redis.call('PUBLISH', KEYS[2], ARGV[4])
return 1
"#;

/// Session records as JSON documents in Redis, with pub/sub change notification.
#[derive(Clone)]
pub struct RedisSessionStore {
    client: Client,
    conn: ConnectionManager,
    ttl_seconds: u64,
    retry: RetryPolicy,
    compare_and_set: Script,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        Ok(Self {
            client,
            conn,
            ttl_seconds,
            retry: RetryPolicy::default(),
            compare_and_set: Script::new(COMPARE_AND_SET),
        })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        let mut conn = self.conn.clone();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = join_code::generate();
            let record = SessionRecord::allocate(id.clone(), session.host_id.clone(), now_millis());
            let body = serde_json::to_string(&record).map_err(corrupt)?;
            let created: Option<String> = redis::cmd("SET")
                .arg(record_key(&id))
                .arg(body)
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_seconds)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if created.is_some() {
                info!(
                    target = "tandem::store",
                    session = %id,
                    host = %record.host_id,
                    "allocated session record"
                );
                return Ok(record);
            }
            debug!(target = "tandem::store", session = %id, "join code collision; retrying");
        }
        Err(StoreError::Unavailable(
            "could not allocate a unique join code".into(),
        ))
    }

    async fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        read_record(&mut self.conn.clone(), id).await
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<SessionRecord, StoreError> {
        let mut conn = self.conn.clone();
        let key = record_key(id);
        let channel = changes_channel(id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = read_record(&mut conn, id).await?;
            let mut next = current.clone();
            let changed = next
                .apply(&patch, now_millis())
                .map_err(|err| StoreError::from_patch(id, err))?;
            if !changed {
                return Ok(current);
            }

            let body = serde_json::to_string(&next).map_err(corrupt)?;
            let outcome: i64 = self
                .compare_and_set
                .key(&key)
                .key(&channel)
                .arg(current.revision)
                .arg(body)
                .arg(self.ttl_seconds)
                .arg(next.revision)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            match outcome {
                1 => return Ok(next),
                0 => {
                    trace!(
                        target = "tandem::store",
                        session = %id,
                        revision = current.revision,
                        "record moved underneath write; retrying"
                    );
                }
                _ => return Err(StoreError::NotFound(id.clone())),
            }
        }

        Err(StoreError::Unavailable(format!(
            "write to session {id} kept conflicting"
        )))
    }

    async fn subscribe(&self, id: &SessionId) -> Result<SessionSubscription, StoreError> {
        let record = self.get(id).await?;
        let (tx, rx) = watch::channel(SessionEvent::Snapshot(record));
        let pump = tokio::spawn(pump_changes(self.clone(), id.clone(), tx));
        Ok(SessionSubscription::with_pump(rx, pump))
    }
}

enum WatchEnd {
    Removed,
    Disconnected,
    Abandoned,
}

async fn pump_changes(store: RedisSessionStore, id: SessionId, tx: watch::Sender<SessionEvent>) {
    let mut attempt = 0u32;
    loop {
        let reason = match watch_changes(&store, &id, &tx, &mut attempt).await {
            Ok(WatchEnd::Removed) => {
                info!(target = "tandem::store", session = %id, "session record removed");
                tx.send_replace(SessionEvent::Removed);
                return;
            }
            Ok(WatchEnd::Abandoned) => return,
            Ok(WatchEnd::Disconnected) => "change feed disconnected".to_string(),
            Err(err) => err.to_string(),
        };

        if tx.is_closed() {
            return;
        }
        if attempt >= store.retry.max_attempts {
            warn!(
                target = "tandem::store",
                session = %id,
                attempts = attempt,
                error = %reason,
                "giving up on session change feed"
            );
            tx.send_replace(SessionEvent::Unavailable(reason));
            return;
        }

        let delay = store.retry.delay(attempt);
        attempt += 1;
        warn!(
            target = "tandem::store",
            session = %id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "session change feed interrupted; reconnecting"
        );
        tx.send_replace(SessionEvent::Unavailable(reason));
        tokio::time::sleep(delay).await;
    }
}

async fn watch_changes(
    store: &RedisSessionStore,
    id: &SessionId,
    tx: &watch::Sender<SessionEvent>,
    attempt: &mut u32,
) -> Result<WatchEnd, StoreError> {
    let mut pubsub = store.client.get_async_pubsub().await.map_err(unavailable)?;
    pubsub
        .subscribe(changes_channel(id))
        .await
        .map_err(unavailable)?;
    *attempt = 0;

    let mut conn = store.conn.clone();
    // Anything published while we were disconnected is folded into one read.
    if !publish_latest(&mut conn, id, tx).await? {
        return Ok(WatchEnd::Removed);
    }

    let mut messages = pubsub.on_message();
    while messages.next().await.is_some() {
        if tx.is_closed() {
            return Ok(WatchEnd::Abandoned);
        }
        if !publish_latest(&mut conn, id, tx).await? {
            return Ok(WatchEnd::Removed);
        }
    }
    Ok(WatchEnd::Disconnected)
}

async fn publish_latest(
    conn: &mut ConnectionManager,
    id: &SessionId,
    tx: &watch::Sender<SessionEvent>,
) -> Result<bool, StoreError> {
    match read_record(conn, id).await {
        Ok(record) => {
            let next = SessionEvent::Snapshot(record);
            tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
            Ok(true)
        }
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn read_record(
    conn: &mut ConnectionManager,
    id: &SessionId,
) -> Result<SessionRecord, StoreError> {
    let body: Option<String> = conn.get(record_key(id)).await.map_err(unavailable)?;
    let body = body.ok_or_else(|| StoreError::NotFound(id.clone()))?;
    let record: SessionRecord = serde_json::from_str(&body).map_err(corrupt)?;
    Ok(record.normalized())
}

fn record_key(id: &SessionId) -> String {
    format!("tandem:session:{}", id)
}

fn changes_channel(id: &SessionId) -> String {
    format!("tandem:session:{}:changes", id)
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn corrupt(err: serde_json::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}
