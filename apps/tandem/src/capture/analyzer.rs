use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::AudioClip;

/// Finding returned by the insight service, e.g. `{"type": "FATIGUE", "level": 7}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: InsightLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Severity as the service reports it: a score or a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsightLevel {
    Score(serde_json::Number),
    Label(String),
}

impl InsightLevel {
    pub fn score(&self) -> Option<f64> {
        match self {
            InsightLevel::Score(n) => n.as_f64(),
            InsightLevel::Label(_) => None,
        }
    }
}

impl From<&str> for InsightLevel {
    fn from(label: &str) -> Self {
        InsightLevel::Label(label.to_string())
    }
}

impl From<i64> for InsightLevel {
    fn from(score: i64) -> Self {
        InsightLevel::Score(score.into())
    }
}

impl fmt::Display for InsightLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsightLevel::Score(n) => write!(f, "{n}"),
            InsightLevel::Label(label) => f.write_str(label),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("analyzer rejected request: {0}")]
    Rejected(String),
}

/// Opaque AI analysis of one image plus the audio around it.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, jpeg: &[u8], audio: &AudioClip) -> Result<InsightEvent, AnalyzeError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    image: String,
    audio: &'a [f32],
    sample_rate: u32,
}

#[derive(Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AnalyzeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, jpeg: &[u8], audio: &AudioClip) -> Result<InsightEvent, AnalyzeError> {
        let body = AnalyzeRequest {
            image: STANDARD.encode(jpeg),
            audio: &audio.samples,
            sample_rate: audio.sample_rate,
        };
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AnalyzeError::Rejected(format!("{status}: {text}")));
        }
        Ok(resp.json::<InsightEvent>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insight_events_use_the_service_field_names() {
        let event: InsightEvent =
            serde_json::from_str(r#"{"type":"FATIGUE","level":"high","timestamp":3}"#).unwrap();
        assert_eq!(event.kind, "FATIGUE");
        assert_eq!(event.message, None);
        assert_eq!(event.level, InsightLevel::from("high"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "FATIGUE");
    }

    #[test]
    fn numeric_levels_are_accepted() {
        let event: InsightEvent = serde_json::from_str(r#"{"type":"FATIGUE","level":7}"#).unwrap();
        assert_eq!(event.level, InsightLevel::from(7));
        assert_eq!(event.level.score(), Some(7.0));
        assert_eq!(event.level.to_string(), "7");
        assert_eq!(event.timestamp, 0);
        assert_eq!(serde_json::to_value(&event).unwrap()["level"], 7);
    }

    #[test]
    fn requests_carry_base64_image_and_raw_audio() {
        let audio = AudioClip {
            sample_rate: 8_000,
            samples: vec![0.5, -0.5],
        };
        let body = AnalyzeRequest {
            image: STANDARD.encode([0xFF, 0xD8]),
            audio: &audio.samples,
            sample_rate: audio.sample_rate,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["image"], "/9g=");
        assert_eq!(value["sampleRate"], 8_000);
        assert_eq!(value["audio"][1], -0.5);
    }
}
