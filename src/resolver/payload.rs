//! Encrypted intermediary payloads.
//!
//! Some intermediaries ship their candidate list as an AES-GCM blob parked
//! in script globals: base64 key, IV and ciphertext, tag appended to the
//! ciphertext. The AEAD authenticates the trailing 16-byte tag as part of
//! decryption, so a tampered payload fails closed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use crate::errors::ResolveError;

/// Raw script globals lifted off the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct PayloadCandidate {
    pub url: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
struct PayloadEnvelope {
    candidates: Vec<PayloadCandidate>,
}

/// Look for `key` / `iv` / `data` base64 globals in the page scripts.
pub fn detect(html: &str) -> Option<EncryptedPayload> {
    let grab = |name: &str| -> Option<Vec<u8>> {
        let re = regex::Regex::new(&format!(
            r#"(?:var|let|const)\s+{name}\s*=\s*["']([A-Za-z0-9+/=]+)["']"#
        ))
        .ok()?;
        let caps = re.captures(html)?;
        BASE64.decode(&caps[1]).ok()
    };

    let key = grab("key")?;
    let iv = grab("iv")?;
    let data = grab("data").or_else(|| grab("encrypted"))?;
    Some(EncryptedPayload { key, iv, data })
}

/// Decrypt and parse the embedded candidate list.
pub fn decrypt(payload: &EncryptedPayload) -> Result<Vec<PayloadCandidate>, ResolveError> {
    if payload.iv.len() != 12 {
        return Err(ResolveError::BadPayload {
            message: format!("unexpected IV length {}", payload.iv.len()),
        });
    }
    if payload.data.len() < 16 {
        return Err(ResolveError::BadPayload {
            message: "ciphertext shorter than its tag".to_string(),
        });
    }

    let nonce = Nonce::from_slice(&payload.iv);
    let plaintext = match payload.key.len() {
        16 => Aes128Gcm::new_from_slice(&payload.key)
            .map_err(|_| bad_key())?
            .decrypt(nonce, payload.data.as_slice()),
        32 => Aes256Gcm::new_from_slice(&payload.key)
            .map_err(|_| bad_key())?
            .decrypt(nonce, payload.data.as_slice()),
        other => {
            return Err(ResolveError::BadPayload {
                message: format!("unsupported key length {other}"),
            });
        }
    }
    .map_err(|_| ResolveError::BadPayload {
        message: "authentication failed".to_string(),
    })?;

    parse_candidates(&plaintext)
}

fn bad_key() -> ResolveError {
    ResolveError::BadPayload {
        message: "malformed key".to_string(),
    }
}

/// The JSON inside varies: a bare array, an envelope, or a single object.
fn parse_candidates(plaintext: &[u8]) -> Result<Vec<PayloadCandidate>, ResolveError> {
    if let Ok(list) = serde_json::from_slice::<Vec<PayloadCandidate>>(plaintext) {
        return Ok(list);
    }
    if let Ok(envelope) = serde_json::from_slice::<PayloadEnvelope>(plaintext) {
        return Ok(envelope.candidates);
    }
    if let Ok(single) = serde_json::from_slice::<PayloadCandidate>(plaintext) {
        return Ok(vec![single]);
    }
    Err(ResolveError::BadPayload {
        message: "decrypted payload is not a candidate list".to_string(),
    })
}
