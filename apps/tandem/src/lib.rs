//! Remote sensor handoff between a desktop and a mobile peer.
//!
//! Two peers share one session record in an external store. Exactly one of
//! them holds producer rights at a time; it captures frames, seals them with
//! [`payload_codec`] and pushes them through a fenced write. Each peer runs a
//! reconciler that drives its capture agent from the latest record.

pub mod arbiter;
pub mod capture;
pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use arbiter::{Arbiter, Directive, Grant, arbitrate};
pub use capture::{CaptureAgent, CaptureSettings, CaptureStatus};
pub use config::Config;
pub use error::HandoffError;
pub use session::{ActiveSource, Peer, SessionId, SessionManager, SessionRecord};
pub use store::{InMemorySessionStore, RedisSessionStore, SessionStore, SharedStore, StoreError};
pub use sync::{DisplayFeed, Reconciler, SyncHandle};
