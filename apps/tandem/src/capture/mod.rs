//! Capture agent: owns the camera/microphone while this peer is the active
//! source and pushes frames through the arbiter's fenced write.

pub mod analyzer;
pub mod device;
pub mod encode;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use payload_codec::{CryptoContext, Sealed};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

pub use self::analyzer::{AnalyzeError, Analyzer, HttpAnalyzer, InsightEvent, InsightLevel};
pub use self::device::{AudioClip, MediaDevice, MediaStream, RawFrame, SyntheticCamera};

use crate::arbiter::{Arbiter, Grant};
use crate::error::HandoffError;
use crate::session::{Frame, FrameMetadata, SessionId, now_millis};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera or microphone permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_interval: Duration,
    pub analysis_interval: Duration,
    pub jpeg_quality: u8,
    pub encrypt_frames: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_secs(1),
            analysis_interval: Duration::from_secs(20),
            jpeg_quality: encode::DEFAULT_JPEG_QUALITY,
            encrypt_frames: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Uplink {
    #[default]
    Healthy,
    /// The last frame write did not reach the store; capture continues.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFailure {
    PermissionDenied,
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    Capturing {
        epoch: u64,
        frames_sent: u64,
        uplink: Uplink,
    },
    Failed(CaptureFailure),
}

/// What `ensure_running` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// Opened the device and started the capture task.
    Started,
    /// Already capturing; switched to the newer grant without reopening.
    Adopted,
    /// Already capturing under this grant.
    Unchanged,
    /// The device could not be opened for this grant.
    Failed,
}

#[derive(Default)]
struct AgentState {
    grant: Option<Grant>,
    task: Option<JoinHandle<()>>,
    /// Grant whose device open was refused; not retried until the epoch moves
    /// or `retry_permissions` is called.
    refused: Option<(SessionId, u64)>,
    frames_sent: u64,
    /// Outcome of the last frame write, kept across grant changes.
    uplink: Uplink,
}

type StreamSlot = Arc<Mutex<Option<Box<dyn MediaStream>>>>;

struct Inner {
    device: Arc<dyn MediaDevice>,
    arbiter: Arbiter,
    crypto: Arc<CryptoContext>,
    analyzer: Option<Arc<dyn Analyzer>>,
    settings: CaptureSettings,
    state: Mutex<AgentState>,
    stream: StreamSlot,
    status: watch::Sender<CaptureStatus>,
    insights: broadcast::Sender<InsightEvent>,
}

#[derive(Clone)]
pub struct CaptureAgent {
    inner: Arc<Inner>,
}

impl CaptureAgent {
    pub fn new(
        device: Arc<dyn MediaDevice>,
        arbiter: Arbiter,
        crypto: Arc<CryptoContext>,
        settings: CaptureSettings,
    ) -> Self {
        let (status, _) = watch::channel(CaptureStatus::Idle);
        let (insights, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                device,
                arbiter,
                crypto,
                analyzer: None,
                settings,
                state: Mutex::new(AgentState::default()),
                stream: Arc::new(Mutex::new(None)),
                status,
                insights,
            }),
        }
    }

    /// Enables the periodic analysis upload. Must be called before the agent is cloned.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.analyzer = Some(analyzer),
            None => warn!(target = "tandem::capture", "agent already shared; analyzer ignored"),
        }
        self
    }

    pub fn status(&self) -> watch::Receiver<CaptureStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> CaptureStatus {
        self.inner.status.borrow().clone()
    }

    pub fn insights(&self) -> broadcast::Receiver<InsightEvent> {
        self.inner.insights.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }

    pub fn grant(&self) -> Option<Grant> {
        self.inner.state.lock().grant.clone()
    }

    /// Makes sure capture is running under `grant`. Safe to call repeatedly.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_running(&self, grant: &Grant) -> Ensured {
        let mut state = self.inner.state.lock();

        if state.task.is_some() {
            return match &state.grant {
                Some(current) if current == grant => Ensured::Unchanged,
                _ => {
                    debug!(
                        target = "tandem::capture",
                        session = %grant.session,
                        epoch = grant.epoch,
                        "adopting newer grant"
                    );
                    state.grant = Some(grant.clone());
                    self.inner.publish_capturing(&state);
                    Ensured::Adopted
                }
            };
        }

        if state.refused.as_ref() == Some(&(grant.session.clone(), grant.epoch)) {
            return Ensured::Failed;
        }

        let stream = match self.inner.device.open() {
            Ok(stream) => stream,
            Err(err) => {
                let failure = match err {
                    CaptureError::PermissionDenied => CaptureFailure::PermissionDenied,
                    other => CaptureFailure::DeviceUnavailable(other.to_string()),
                };
                warn!(
                    target = "tandem::capture",
                    session = %grant.session,
                    epoch = grant.epoch,
                    failure = ?failure,
                    "could not open capture device"
                );
                state.refused = Some((grant.session.clone(), grant.epoch));
                self.inner
                    .status
                    .send_replace(CaptureStatus::Failed(failure));
                return Ensured::Failed;
            }
        };

        *self.inner.stream.lock() = Some(stream);
        state.grant = Some(grant.clone());
        state.refused = None;
        state.frames_sent = 0;
        state.uplink = Uplink::Healthy;
        state.task = Some(tokio::spawn(run(self.inner.clone())));
        self.inner.publish_capturing(&state);
        info!(
            target = "tandem::capture",
            session = %grant.session,
            peer = %grant.peer,
            epoch = grant.epoch,
            "capture started"
        );
        Ensured::Started
    }

    /// Stops capture and releases the device before returning.
    ///
    /// Returns whether anything was running.
    pub fn stop(&self) -> bool {
        self.inner.halt(None)
    }

    /// Forgets an earlier permission refusal so the next grant opens the device again.
    pub fn retry_permissions(&self) {
        self.inner.state.lock().refused = None;
        self.inner.status.send_if_modified(|status| {
            if matches!(status, CaptureStatus::Failed(_)) {
                *status = CaptureStatus::Idle;
                true
            } else {
                false
            }
        });
    }
}

impl Inner {
    fn publish_capturing(&self, state: &AgentState) {
        if let Some(grant) = &state.grant {
            self.status.send_replace(CaptureStatus::Capturing {
                epoch: grant.epoch,
                frames_sent: state.frames_sent,
                uplink: state.uplink,
            });
        }
    }

    /// Tears down capture. With `only_epoch` set, does nothing unless the
    /// agent is still on that epoch, so a stale task cannot stop a newer run.
    fn halt(&self, only_epoch: Option<u64>) -> bool {
        let task = {
            let mut state = self.state.lock();
            if let Some(epoch) = only_epoch {
                if state.grant.as_ref().map(|g| g.epoch) != Some(epoch) {
                    return false;
                }
            }
            state.grant = None;
            state.task.take()
        };

        let released = match self.stream.lock().take() {
            Some(mut stream) => {
                stream.release();
                true
            }
            None => false,
        };
        let was_running = task.is_some();
        if let Some(task) = task {
            task.abort();
        }

        self.status.send_if_modified(|status| {
            if matches!(status, CaptureStatus::Capturing { .. }) {
                *status = CaptureStatus::Idle;
                true
            } else {
                false
            }
        });
        if was_running || released {
            info!(target = "tandem::capture", "capture stopped; device released");
        }
        was_running
    }
}

struct Captured {
    jpeg: Vec<u8>,
    image: String,
    audio: Option<AudioClip>,
}

enum Tick {
    Continue,
    Exit,
}

async fn run(inner: Arc<Inner>) {
    let settings = inner.settings.clone();
    let mut frames = time::interval(settings.frame_interval);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut analysis = time::interval_at(
        time::Instant::now() + settings.analysis_interval,
        settings.analysis_interval,
    );
    analysis.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut latest: Option<(Vec<u8>, AudioClip)> = None;

    loop {
        tokio::select! {
            _ = frames.tick() => {
                if let Tick::Exit = capture_tick(&inner, &mut latest).await {
                    return;
                }
            }
            _ = analysis.tick(), if inner.analyzer.is_some() => {
                if let (Some(analyzer), Some((jpeg, audio))) = (inner.analyzer.clone(), latest.clone()) {
                    tokio::spawn(analyze(analyzer, jpeg, audio, inner.insights.clone()));
                }
            }
        }
    }
}

async fn capture_tick(inner: &Arc<Inner>, latest: &mut Option<(Vec<u8>, AudioClip)>) -> Tick {
    let Some(grant) = inner.state.lock().grant.clone() else {
        return Tick::Exit;
    };

    let captured = match capture_one(inner) {
        Ok(Some(captured)) => captured,
        Ok(None) => return Tick::Exit,
        Err(err) => {
            warn!(target = "tandem::capture", session = %grant.session, error = %err, "frame capture failed");
            return Tick::Continue;
        }
    };

    let vocal_tension = captured.audio.as_ref().and_then(encode::vocal_tension);
    if let Some(audio) = captured.audio {
        *latest = Some((captured.jpeg, audio));
    }

    let image = match Sealed::seal(&inner.crypto, captured.image, inner.settings.encrypt_frames) {
        Ok(image) => image,
        Err(err) => {
            warn!(target = "tandem::capture", session = %grant.session, error = %err, "frame encryption failed");
            return Tick::Continue;
        }
    };
    let frame = Frame {
        image,
        timestamp: now_millis(),
        metadata: Some(FrameMetadata {
            vocal_tension,
            ..FrameMetadata::default()
        }),
        source: Some(grant.peer),
        epoch: grant.epoch,
    };

    // The grant may have been dropped or replaced while the frame was captured.
    match inner.state.lock().grant.as_ref() {
        None => return Tick::Exit,
        Some(current) if *current != grant => return Tick::Continue,
        Some(_) => {}
    }

    match inner.arbiter.push_frame(&grant, frame).await {
        Ok(_) => {
            let mut state = inner.state.lock();
            if state.grant.as_ref() == Some(&grant) {
                state.frames_sent += 1;
                state.uplink = Uplink::Healthy;
                inner.publish_capturing(&state);
            }
            trace!(target = "tandem::capture", session = %grant.session, epoch = grant.epoch, "frame pushed");
            Tick::Continue
        }
        Err(HandoffError::StoreUnavailable(reason)) => {
            warn!(
                target = "tandem::capture",
                session = %grant.session,
                error = %reason,
                "frame write failed; uplink degraded"
            );
            let mut state = inner.state.lock();
            if state.grant.as_ref() == Some(&grant) {
                state.uplink = Uplink::Degraded;
                inner.publish_capturing(&state);
            }
            Tick::Continue
        }
        Err(err @ (HandoffError::Superseded { .. } | HandoffError::SessionNotFound(_))) => {
            info!(
                target = "tandem::capture",
                session = %grant.session,
                peer = %grant.peer,
                epoch = grant.epoch,
                reason = %err,
                "lost the session; stopping capture"
            );
            if inner.halt(Some(grant.epoch)) {
                Tick::Exit
            } else {
                // A newer grant was adopted while the write was in flight.
                Tick::Continue
            }
        }
        Err(err) => {
            warn!(target = "tandem::capture", session = %grant.session, error = %err, "frame write failed");
            Tick::Continue
        }
    }
}

fn capture_one(inner: &Inner) -> Result<Option<Captured>, CaptureError> {
    let (raw, audio) = {
        let mut slot = inner.stream.lock();
        let Some(stream) = slot.as_mut() else {
            return Ok(None);
        };
        let raw = stream.capture_frame()?;
        let audio = match stream.capture_audio() {
            Ok(audio) => Some(audio),
            Err(err) => {
                debug!(target = "tandem::capture", error = %err, "no audio this tick");
                None
            }
        };
        (raw, audio)
    };

    let jpeg = encode::encode_jpeg(&raw, inner.settings.jpeg_quality)?;
    let image = STANDARD.encode(&jpeg);
    Ok(Some(Captured { jpeg, image, audio }))
}

async fn analyze(
    analyzer: Arc<dyn Analyzer>,
    jpeg: Vec<u8>,
    audio: AudioClip,
    insights: broadcast::Sender<InsightEvent>,
) {
    match analyzer.analyze(&jpeg, &audio).await {
        Ok(mut event) => {
            if event.timestamp == 0 {
                event.timestamp = now_millis();
            }
            debug!(target = "tandem::capture", kind = %event.kind, level = %event.level, "insight received");
            let _ = insights.send(event);
        }
        Err(err) => {
            warn!(target = "tandem::capture", error = %err, "analysis request failed");
        }
    }
}
