use std::fmt;
use std::str::FromStr;

use payload_codec::Sealed;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-issued session identifier; doubles as the join code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the two physical devices taking part in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Peer {
    Web,
    Mobile,
}

impl Peer {
    pub fn other(self) -> Peer {
        match self {
            Peer::Web => Peer::Mobile,
            Peer::Mobile => Peer::Web,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Peer::Web => "web",
            Peer::Mobile => "mobile",
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Peer {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "web" | "desktop" => Ok(Peer::Web),
            "mobile" | "phone" => Ok(Peer::Mobile),
            other => Err(format!("unknown peer '{other}'")),
        }
    }
}

/// Which peer currently holds producer rights. Serialized as `null`, `"web"` or `"mobile"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<Peer>", into = "Option<Peer>")]
pub enum ActiveSource {
    #[default]
    None,
    Web,
    Mobile,
}

impl ActiveSource {
    pub fn peer(self) -> Option<Peer> {
        match self {
            ActiveSource::None => None,
            ActiveSource::Web => Some(Peer::Web),
            ActiveSource::Mobile => Some(Peer::Mobile),
        }
    }

    pub fn is_held(self) -> bool {
        self != ActiveSource::None
    }
}

impl From<Peer> for ActiveSource {
    fn from(peer: Peer) -> Self {
        match peer {
            Peer::Web => ActiveSource::Web,
            Peer::Mobile => ActiveSource::Mobile,
        }
    }
}

impl From<Option<Peer>> for ActiveSource {
    fn from(peer: Option<Peer>) -> Self {
        peer.map(ActiveSource::from).unwrap_or_default()
    }
}

impl From<ActiveSource> for Option<Peer> {
    fn from(source: ActiveSource) -> Self {
        source.peer()
    }
}

impl fmt::Display for ActiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer() {
            Some(peer) => peer.fmt(f),
            None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocal_tension: Option<f32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Latest frame pushed by the active source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FrameWire", into = "FrameWire")]
pub struct Frame {
    /// Base64 JPEG, either in the clear or sealed by the payload codec.
    pub image: Sealed<String>,
    pub timestamp: i64,
    pub metadata: Option<FrameMetadata>,
    /// Absent on frames written before sources were recorded.
    pub source: Option<Peer>,
    pub epoch: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameWire {
    image: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<FrameMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<Peer>,
    #[serde(default)]
    epoch: u64,
}

impl From<FrameWire> for Frame {
    fn from(wire: FrameWire) -> Self {
        let image = if wire.encrypted {
            Sealed::Ciphertext(wire.image)
        } else {
            Sealed::Plaintext(wire.image)
        };
        Self {
            image,
            timestamp: wire.timestamp,
            metadata: wire.metadata,
            source: wire.source,
            epoch: wire.epoch,
        }
    }
}

impl From<Frame> for FrameWire {
    fn from(frame: Frame) -> Self {
        let (image, encrypted) = match frame.image {
            Sealed::Plaintext(image) => (image, false),
            Sealed::Ciphertext(image) => (image, true),
        };
        Self {
            image,
            timestamp: frame.timestamp,
            encrypted,
            metadata: frame.metadata,
            source: frame.source,
            epoch: frame.epoch,
        }
    }
}

/// The shared record coordinating one handoff between the two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub host_id: String,
    pub allocated: bool,
    pub running: bool,
    #[serde(default)]
    pub active_source: ActiveSource,
    #[serde(default)]
    pub frame: Option<Frame>,
    /// Fencing token; bumped every time `active_source` changes.
    #[serde(default)]
    pub epoch: u64,
    /// Bumped on every committed write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl SessionRecord {
    pub fn allocate(id: SessionId, host_id: impl Into<String>, now: i64) -> Self {
        Self {
            id,
            host_id: host_id.into(),
            allocated: true,
            running: false,
            active_source: ActiveSource::None,
            frame: None,
            epoch: 0,
            revision: 0,
            closed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn holder(&self) -> Option<Peer> {
        if self.running {
            self.active_source.peer()
        } else {
            None
        }
    }

    /// Repairs records written by clients that did not keep the invariants.
    pub fn normalized(mut self) -> Self {
        if !self.running || self.closed {
            self.running = false;
            self.active_source = ActiveSource::None;
            self.frame = None;
        }
        self
    }

    /// Applies `patch` in place, enforcing the record invariants and the patch's
    /// precondition. Returns `Ok(false)` when the patch was an accepted no-op.
    pub fn apply(&mut self, patch: &SessionPatch, now: i64) -> Result<bool, PatchError> {
        if self.closed {
            if patch.is_stop() {
                return Ok(false);
            }
            return Err(PatchError::Closed);
        }

        match patch.precondition {
            Some(Precondition::Epoch(expected)) if expected != self.epoch => {
                return Err(self.stale());
            }
            Some(Precondition::Holder { peer, epoch })
                if epoch != self.epoch || self.holder() != Some(peer) =>
            {
                return Err(self.stale());
            }
            _ => {}
        }

        let previous = self.active_source;

        if let Some(running) = patch.running {
            self.running = running;
        }
        if let Some(source) = patch.active_source {
            // Releasing the holder ends the run.
            self.active_source = source;
            self.running = source.is_held();
        }
        if let Some(frame) = &patch.frame {
            self.frame = frame.clone();
        }
        if patch.close {
            self.running = false;
            self.closed = true;
        }
        if !self.running {
            self.active_source = ActiveSource::None;
            self.frame = None;
        }
        if self.active_source != previous {
            self.epoch += 1;
            if patch.frame.is_none() {
                // The outgoing holder's last frame is not the new holder's feed.
                self.frame = None;
            }
        }

        self.revision += 1;
        self.updated_at = now;
        Ok(true)
    }

    fn stale(&self) -> PatchError {
        PatchError::Stale {
            epoch: self.epoch,
            holder: self.active_source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Commit only if the record is still at this epoch.
    Epoch(u64),
    /// Commit only if `peer` still holds the session at `epoch`.
    Holder { peer: Peer, epoch: u64 },
}

/// A partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub running: Option<bool>,
    pub active_source: Option<ActiveSource>,
    pub frame: Option<Option<Frame>>,
    pub close: bool,
    pub precondition: Option<Precondition>,
}

impl SessionPatch {
    pub fn running(running: bool) -> Self {
        Self {
            running: Some(running),
            ..Self::default()
        }
    }

    pub fn active_source(source: ActiveSource) -> Self {
        Self {
            active_source: Some(source),
            ..Self::default()
        }
    }

    /// Take producer rights, provided nobody else changed hands since `observed_epoch`.
    pub fn claim(peer: Peer, observed_epoch: u64) -> Self {
        Self {
            running: Some(true),
            active_source: Some(peer.into()),
            precondition: Some(Precondition::Epoch(observed_epoch)),
            ..Self::default()
        }
    }

    /// Fenced frame write from `peer` holding the session at `epoch`.
    pub fn frame(peer: Peer, epoch: u64, frame: Frame) -> Self {
        Self {
            frame: Some(Some(frame)),
            precondition: Some(Precondition::Holder { peer, epoch }),
            ..Self::default()
        }
    }

    pub fn terminate() -> Self {
        Self {
            running: Some(false),
            active_source: Some(ActiveSource::None),
            frame: Some(None),
            close: true,
            precondition: None,
        }
    }

    /// A patch whose only effect is stopping the session.
    pub fn is_stop(&self) -> bool {
        self.running == Some(false)
            && matches!(self.active_source, None | Some(ActiveSource::None))
            && matches!(self.frame, None | Some(None))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("session is closed")]
    Closed,
    #[error("precondition failed: session at epoch {epoch}, held by {holder}")]
    Stale { epoch: u64, holder: ActiveSource },
}

pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
