use std::env;
use std::time::Duration;

use payload_codec::{CryptoContext, DEFAULT_KDF_ITERATIONS, DEFAULT_SALT, DEFAULT_SECRET};

use crate::arbiter::DEFAULT_MAX_CLAIM_ATTEMPTS;
use crate::capture::CaptureSettings;
use crate::capture::encode::DEFAULT_JPEG_QUALITY;

/// Tandem runtime configuration
#[derive(Clone)]
pub struct Config {
    pub redis_url: String,
    pub session_ttl_seconds: u64,
    pub shared_secret: String,
    pub kdf_iterations: u32,
    pub encrypt_frames: bool,
    pub frame_interval_ms: u64,
    pub analysis_interval_ms: u64,
    pub jpeg_quality: u8,
    pub max_claim_attempts: u32,
    pub analyzer_url: Option<String>,
    pub log_filter: String,
}

impl Config {
    /// Load configuration from `TANDEM_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("TANDEM_REDIS_URL").unwrap_or(defaults.redis_url),
            session_ttl_seconds: parsed::<u64>("TANDEM_SESSION_TTL").unwrap_or(defaults.session_ttl_seconds),
            shared_secret: env::var("TANDEM_SHARED_SECRET")
                .ok()
                .filter(|secret| !secret.is_empty())
                .unwrap_or(defaults.shared_secret),
            kdf_iterations: parsed::<u32>("TANDEM_KDF_ITERATIONS")
                .filter(|iterations| *iterations > 0)
                .unwrap_or(defaults.kdf_iterations),
            encrypt_frames: env::var("TANDEM_ENCRYPT_FRAMES")
                .map(|value| !(value == "0" || value.eq_ignore_ascii_case("false")))
                .unwrap_or(defaults.encrypt_frames),
            frame_interval_ms: parsed::<u64>("TANDEM_FRAME_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.frame_interval_ms),
            analysis_interval_ms: parsed::<u64>("TANDEM_ANALYSIS_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.analysis_interval_ms),
            jpeg_quality: parsed::<u8>("TANDEM_JPEG_QUALITY")
                .map(|q| q.clamp(1, 100))
                .unwrap_or(defaults.jpeg_quality),
            max_claim_attempts: parsed::<u32>("TANDEM_CLAIM_ATTEMPTS")
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.max_claim_attempts),
            analyzer_url: env::var("TANDEM_ANALYZER_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            log_filter: env::var("RUST_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn crypto_context(&self) -> CryptoContext {
        CryptoContext::with_params(self.shared_secret.clone(), DEFAULT_SALT, self.kdf_iterations)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            analysis_interval: Duration::from_millis(self.analysis_interval_ms),
            jpeg_quality: self.jpeg_quality,
            encrypt_frames: self.encrypt_frames,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            session_ttl_seconds: 86_400, // one day
            shared_secret: DEFAULT_SECRET.to_string(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            encrypt_frames: true,
            frame_interval_ms: 1_000,
            analysis_interval_ms: 20_000,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_claim_attempts: DEFAULT_MAX_CLAIM_ATTEMPTS,
            analyzer_url: None,
            log_filter: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &self.redis_url)
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("shared_secret", &"<redacted>")
            .field("kdf_iterations", &self.kdf_iterations)
            .field("encrypt_frames", &self.encrypt_frames)
            .field("frame_interval_ms", &self.frame_interval_ms)
            .field("analysis_interval_ms", &self.analysis_interval_ms)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("max_claim_attempts", &self.max_claim_attempts)
            .field("analyzer_url", &self.analyzer_url)
            .finish()
    }
}
