use image::ColorType;
use image::codecs::jpeg::JpegEncoder;

use super::CaptureError;
use super::device::{AudioClip, RawFrame};

pub const DEFAULT_JPEG_QUALITY: u8 = 60;

pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.rgb.len() != expected {
        return Err(CaptureError::Encode(format!(
            "frame is {} bytes, expected {expected} for {}x{}",
            frame.rgb.len(),
            frame.width,
            frame.height
        )));
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&frame.rgb, frame.width, frame.height, ColorType::Rgb8)
        .map_err(|err| CaptureError::Encode(err.to_string()))?;
    Ok(out)
}

/// Rough 0..1 estimate of vocal strain from loudness and brightness.
///
/// RMS carries loudness; zero-crossing rate stands in for pitch/brightness.
/// Silence yields `None`.
pub fn vocal_tension(clip: &AudioClip) -> Option<f32> {
    if clip.samples.len() < 2 {
        return None;
    }
    let energy: f32 = clip.samples.iter().map(|s| s * s).sum();
    let rms = (energy / clip.samples.len() as f32).sqrt();
    if rms < 1e-3 {
        return None;
    }
    let crossings = clip
        .samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    let zcr = crossings as f32 / (clip.samples.len() - 1) as f32;

    let loudness = (rms / 0.5).min(1.0);
    let brightness = (zcr / 0.1).min(1.0);
    Some((0.6 * loudness + 0.4 * brightness).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn tone(freq: f32, amplitude: f32) -> AudioClip {
        let sample_rate = 16_000;
        AudioClip {
            sample_rate,
            samples: (0..4_000)
                .map(|n| amplitude * (TAU * freq * n as f32 / sample_rate as f32).sin())
                .collect(),
        }
    }

    #[test]
    fn encodes_a_jpeg() {
        let frame = RawFrame {
            width: 4,
            height: 2,
            rgb: vec![128; 4 * 2 * 3],
        };
        let bytes = encode_jpeg(&frame, DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let frame = RawFrame {
            width: 4,
            height: 4,
            rgb: vec![0; 3],
        };
        assert!(matches!(
            encode_jpeg(&frame, DEFAULT_JPEG_QUALITY),
            Err(CaptureError::Encode(_))
        ));
    }

    #[test]
    fn louder_higher_voices_read_as_more_tense() {
        let calm = vocal_tension(&tone(150.0, 0.1)).unwrap();
        let strained = vocal_tension(&tone(600.0, 0.45)).unwrap();
        assert!(strained > calm);
        assert!((0.0..=1.0).contains(&strained));
    }

    #[test]
    fn silence_has_no_reading() {
        assert_eq!(vocal_tension(&AudioClip::default()), None);
        assert_eq!(
            vocal_tension(&AudioClip {
                sample_rate: 16_000,
                samples: vec![0.0; 100],
            }),
            None
        );
    }
}
