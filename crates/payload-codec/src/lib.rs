//! Sealing of structured payloads that travel through the shared session store.
//!
//! Wire format: base64 of `nonce(12) ‖ ciphertext ‖ tag(16)` under AES-256-GCM.
//! Anything that fails to open is handed back untouched as [`Opened::Legacy`],
//! so stores still holding pre-encryption records keep working.

mod context;

pub use context::CryptoContext;

use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
pub const DEFAULT_SECRET: &str = "tandem:frame-relay:shared-secret:v1";
pub const DEFAULT_SALT: &[u8] = b"tandem:frame-relay:salt:v1";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("payload encryption failed")]
    Encrypt,
    #[error("decryption failed: {0}")]
    DecryptionFailed(&'static str),
}

/// Result of opening a payload that may or may not have been sealed.
#[derive(Debug, Clone, PartialEq)]
pub enum Opened<T> {
    Decrypted(T),
    /// The input was not a payload sealed under this context; callers use it as-is.
    Legacy(String),
}

impl<T> Opened<T> {
    pub fn is_legacy(&self) -> bool {
        matches!(self, Opened::Legacy(_))
    }

    pub fn decrypted(self) -> Option<T> {
        match self {
            Opened::Decrypted(value) => Some(value),
            Opened::Legacy(_) => None,
        }
    }
}

impl Opened<String> {
    /// Collapses both cases into the carried string.
    pub fn into_inner(self) -> String {
        match self {
            Opened::Decrypted(value) | Opened::Legacy(value) => value,
        }
    }
}

/// A field that is stored either in the clear or sealed with [`encrypt`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sealed<T> {
    Plaintext(T),
    Ciphertext(String),
}

impl<T> Sealed<T> {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Sealed::Ciphertext(_))
    }
}

impl<T: Serialize> Sealed<T> {
    pub fn seal(ctx: &CryptoContext, value: T, encrypt_payload: bool) -> Result<Self, CodecError> {
        if encrypt_payload {
            Ok(Sealed::Ciphertext(encrypt(ctx, &value)?))
        } else {
            Ok(Sealed::Plaintext(value))
        }
    }
}

impl<T: DeserializeOwned + Clone> Sealed<T> {
    pub fn open(&self, ctx: &CryptoContext) -> Opened<T> {
        match self {
            Sealed::Plaintext(value) => Opened::Decrypted(value.clone()),
            Sealed::Ciphertext(wire) => decrypt(ctx, wire),
        }
    }
}

pub fn encrypt<T: Serialize + ?Sized>(ctx: &CryptoContext, value: &T) -> Result<String, CodecError> {
    let plaintext = serde_json::to_vec(value)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    // aes-gcm appends the tag to the ciphertext.
    let sealed = ctx
        .cipher()
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| CodecError::Encrypt)?;

    let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
    wire.extend_from_slice(&nonce_bytes);
    wire.extend_from_slice(&sealed);
    Ok(STANDARD.encode(wire))
}

/// Opens `wire`, falling back to [`Opened::Legacy`] on any failure.
pub fn decrypt<T: DeserializeOwned>(ctx: &CryptoContext, wire: &str) -> Opened<T> {
    if !looks_sealed(wire) {
        tracing::debug!(
            target = "payload_codec",
            len = wire.len(),
            "payload is not in sealed form; using legacy plaintext"
        );
        return Opened::Legacy(wire.to_string());
    }

    match try_decrypt(ctx, wire) {
        Ok(value) => Opened::Decrypted(value),
        Err(err) => {
            tracing::warn!(
                target = "payload_codec",
                error = %err,
                len = wire.len(),
                "sealed payload failed to open; secret mismatch or corruption"
            );
            Opened::Legacy(wire.to_string())
        }
    }
}

pub fn try_decrypt<T: DeserializeOwned>(ctx: &CryptoContext, wire: &str) -> Result<T, CodecError> {
    let bytes = STANDARD
        .decode(wire.trim())
        .map_err(|_| CodecError::DecryptionFailed("invalid base64"))?;
    if bytes.len() < NONCE_LEN + TAG_LEN {
        return Err(CodecError::DecryptionFailed("payload shorter than nonce and tag"));
    }

    let (nonce, sealed) = bytes.split_at(NONCE_LEN);
    let plaintext = ctx
        .cipher()
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CodecError::DecryptionFailed("authentication tag mismatch"))?;

    serde_json::from_slice(&plaintext)
        .map_err(|_| CodecError::DecryptionFailed("plaintext is not the expected json"))
}

/// Structural check only: valid base64 long enough to hold a nonce and a tag.
pub fn looks_sealed(wire: &str) -> bool {
    STANDARD
        .decode(wire.trim())
        .map(|bytes| bytes.len() >= NONCE_LEN + TAG_LEN)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::{Value, json};

    fn ctx(secret: &str) -> CryptoContext {
        CryptoContext::with_params(secret, DEFAULT_SALT, 1_000)
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Insight {
        #[serde(rename = "type")]
        kind: String,
        level: u8,
    }

    #[test]
    fn round_trips_assorted_payloads() {
        let ctx = ctx("S");
        let payloads = vec![
            json!({"type": "FATIGUE", "level": 7}),
            json!("a plain string"),
            json!(""),
            json!(0),
            json!([1, 2, 3, {"nested": [true, null]}]),
            json!({"image": "x".repeat(40_000), "timestamp": 1_700_000_000_000_i64}),
            json!({"unicode": "ねむい 😴"}),
        ];
        for payload in payloads {
            let wire = encrypt(&ctx, &payload).unwrap();
            assert_eq!(decrypt::<Value>(&ctx, &wire), Opened::Decrypted(payload));
        }
    }

    #[test]
    fn round_trips_typed_payload() {
        let ctx = ctx("S");
        let insight = Insight { kind: "FATIGUE".into(), level: 7 };
        let wire = encrypt(&ctx, &insight).unwrap();
        assert_eq!(decrypt::<Insight>(&ctx, &wire).decrypted(), Some(insight));
    }

    #[test]
    fn wire_layout_is_nonce_ciphertext_tag() {
        let ctx = ctx("S");
        let body = serde_json::to_vec(&json!({"a": 1})).unwrap();
        let wire = encrypt(&ctx, &json!({"a": 1})).unwrap();
        let raw = STANDARD.decode(&wire).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + body.len() + TAG_LEN);
    }

    #[test]
    fn every_message_gets_a_fresh_nonce() {
        let ctx = ctx("S");
        let a = STANDARD.decode(encrypt(&ctx, "same").unwrap()).unwrap();
        let b = STANDARD.decode(encrypt(&ctx, "same").unwrap()).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_strings_come_back_unchanged() {
        let ctx = ctx("S");
        for input in [
            "",
            "hello world",
            "{\"type\":\"FATIGUE\",\"level\":7}",
            "/9j/4AAQSkZJRgABAQ",
            "AAAA",
            "not base64 at all!!",
        ] {
            assert_eq!(decrypt::<Value>(&ctx, input), Opened::Legacy(input.to_string()));
        }
    }

    #[test]
    fn corrupted_ciphertext_falls_back_to_legacy() {
        let ctx = ctx("S");
        let original = json!({"type": "FATIGUE", "level": 7});
        let wire = encrypt(&ctx, &original).unwrap();

        let mut raw = STANDARD.decode(&wire).unwrap();
        raw[NONCE_LEN] ^= 0x01;
        let corrupted = STANDARD.encode(&raw);

        let opened = decrypt::<Value>(&ctx, &corrupted);
        assert_eq!(opened, Opened::Legacy(corrupted.clone()));
        assert!(matches!(
            try_decrypt::<Value>(&ctx, &corrupted),
            Err(CodecError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn wrong_secret_falls_back_to_legacy() {
        let wire = encrypt(&ctx("S"), &json!({"level": 1})).unwrap();
        let opened = decrypt::<Value>(&ctx("T"), &wire);
        assert!(opened.is_legacy());
    }

    #[test]
    fn shape_mismatch_falls_back_to_legacy() {
        let ctx = ctx("S");
        let wire = encrypt(&ctx, &json!({"unexpected": true})).unwrap();
        assert!(decrypt::<Insight>(&ctx, &wire).is_legacy());
    }

    #[test]
    fn sealed_plaintext_opens_without_decryption() {
        let ctx = ctx("S");
        let sealed = Sealed::seal(&ctx, "frame".to_string(), false).unwrap();
        assert!(!sealed.is_encrypted());
        assert_eq!(sealed.open(&ctx), Opened::Decrypted("frame".to_string()));

        let sealed = Sealed::seal(&ctx, "frame".to_string(), true).unwrap();
        assert!(sealed.is_encrypted());
        assert_eq!(sealed.open(&ctx).into_inner(), "frame");
    }

    #[test]
    fn looks_sealed_checks_structure_only() {
        let ctx = ctx("S");
        assert!(looks_sealed(&encrypt(&ctx, &1).unwrap()));
        assert!(!looks_sealed("short"));
        assert!(!looks_sealed(&STANDARD.encode([0u8; NONCE_LEN + TAG_LEN - 1])));
    }
}
