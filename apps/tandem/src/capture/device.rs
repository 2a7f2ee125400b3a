use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::CaptureError;

/// One RGB8 video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Mono PCM samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioClip {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// A camera/microphone pair that can be opened for capture.
pub trait MediaDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn MediaStream>, CaptureError>;
}

/// An open capture handle. Dropping it must release the hardware as well.
pub trait MediaStream: Send {
    fn capture_frame(&mut self) -> Result<RawFrame, CaptureError>;
    fn capture_audio(&mut self) -> Result<AudioClip, CaptureError>;
    fn release(&mut self);
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    released: AtomicUsize,
    frames: AtomicU64,
    deny: AtomicBool,
}

/// Test pattern camera and tone generator.
#[derive(Clone)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    sample_rate: u32,
    counters: Arc<Counters>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            sample_rate: 16_000,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Makes subsequent `open` calls fail as if the user refused access.
    pub fn deny_permission(&self, deny: bool) {
        self.counters.deny.store(deny, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Handles currently held.
    pub fn in_use(&self) -> usize {
        self.opened().saturating_sub(self.released())
    }

    pub fn frames_captured(&self) -> u64 {
        self.counters.frames.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

impl MediaDevice for SyntheticCamera {
    fn open(&self) -> Result<Box<dyn MediaStream>, CaptureError> {
        if self.counters.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied);
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticStream {
            width: self.width,
            height: self.height,
            sample_rate: self.sample_rate,
            tick: 0,
            released: false,
            counters: self.counters.clone(),
        }))
    }
}

struct SyntheticStream {
    width: u32,
    height: u32,
    sample_rate: u32,
    tick: u64,
    released: bool,
    counters: Arc<Counters>,
}

impl MediaStream for SyntheticStream {
    fn capture_frame(&mut self) -> Result<RawFrame, CaptureError> {
        if self.released {
            return Err(CaptureError::DeviceUnavailable("stream released".into()));
        }
        self.tick += 1;
        self.counters.frames.fetch_add(1, Ordering::SeqCst);

        let shift = (self.tick % 256) as u32;
        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                rgb.push(((x * 255 / self.width + shift) % 256) as u8);
                rgb.push(((y * 255 / self.height) % 256) as u8);
                rgb.push(((x + y + shift) % 256) as u8);
            }
        }
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            rgb,
        })
    }

    fn capture_audio(&mut self) -> Result<AudioClip, CaptureError> {
        if self.released {
            return Err(CaptureError::DeviceUnavailable("stream released".into()));
        }
        // A quarter second of tone whose pitch drifts with the tick.
        let len = (self.sample_rate / 4) as usize;
        let pitch = 180.0 + (self.tick % 20) as f32 * 10.0;
        let samples = (0..len)
            .map(|n| 0.4 * (TAU * pitch * n as f32 / self.sample_rate as f32).sin())
            .collect();
        Ok(AudioClip {
            sample_rate: self.sample_rate,
            samples,
        })
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_release_once() {
        let camera = SyntheticCamera::default();
        let mut stream = camera.open().unwrap();
        assert_eq!(camera.in_use(), 1);
        stream.release();
        stream.release();
        drop(stream);
        assert_eq!(camera.released(), 1);
        assert_eq!(camera.in_use(), 0);
    }

    #[test]
    fn dropping_a_stream_releases_it() {
        let camera = SyntheticCamera::default();
        drop(camera.open().unwrap());
        assert_eq!(camera.in_use(), 0);
    }

    #[test]
    fn denied_permission_opens_nothing() {
        let camera = SyntheticCamera::default();
        camera.deny_permission(true);
        assert!(matches!(camera.open(), Err(CaptureError::PermissionDenied)));
        assert_eq!(camera.opened(), 0);
    }

    #[test]
    fn frames_have_the_configured_shape() {
        let camera = SyntheticCamera::new(8, 4);
        let mut stream = camera.open().unwrap();
        let frame = stream.capture_frame().unwrap();
        assert_eq!(frame.rgb.len(), 8 * 4 * 3);
        let audio = stream.capture_audio().unwrap();
        assert_eq!(audio.samples.len(), 4_000);

        stream.release();
        assert!(stream.capture_frame().is_err());
    }
}
