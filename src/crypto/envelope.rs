//! Versioned AES-256-GCM envelope.
//!
//! Wire format: `base64(json({"v":1,"alg":"AES-256-GCM","iv":..,"ct":..,"tag":..}))`
//! where `iv`, `ct` and `tag` are standard base64. The nonce is 12 random
//! bytes drawn for every call to [`encrypt`]; the tag is 16 bytes.

use super::{key::SessionKey, CryptoError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use serde_json::Value;

pub const ENVELOPE_VERSION: u64 = 1;
pub const ALGORITHM_ID: &str = "AES-256-GCM";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Serialize)]
struct WireEnvelope<'a> {
    v: u64,
    alg: &'a str,
    iv: String,
    ct: String,
    tag: String,
}

/// Envelope fields as found on the wire, before any validation.
struct RawEnvelope {
    version: u64,
    algorithm: String,
    nonce: String,
    ciphertext: String,
    tag: String,
}

/// Encrypt `plaintext` into a fresh envelope.
///
/// # Errors
/// Returns `CryptoError::EncryptionFailure` if the OS RNG or the cipher fails.
/// There is no degraded mode: callers must not store the plaintext instead.
#[allow(deprecated)]
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|err| CryptoError::EncryptionFailure(format!("nonce generation: {err}")))?;

    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|_| CryptoError::EncryptionFailure("invalid key length".to_string()))?;

    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|err| CryptoError::EncryptionFailure(err.to_string()))?;

    // aes-gcm appends the tag; the envelope keeps it in its own field.
    let Some(split_at) = ciphertext.len().checked_sub(TAG_LEN) else {
        return Err(CryptoError::EncryptionFailure(
            "cipher output shorter than tag".to_string(),
        ));
    };
    let tag = ciphertext.split_off(split_at);

    let envelope = WireEnvelope {
        v: ENVELOPE_VERSION,
        alg: ALGORITHM_ID,
        iv: Base64::encode_string(&nonce_bytes),
        ct: Base64::encode_string(&ciphertext),
        tag: Base64::encode_string(&tag),
    };
    let json = serde_json::to_vec(&envelope)
        .map_err(|err| CryptoError::EncryptionFailure(err.to_string()))?;

    Ok(Base64::encode_string(&json))
}

/// Decrypt an envelope produced by [`encrypt`].
///
/// # Errors
/// * `FormatMismatch` if the input is not an envelope at all.
/// * `UnsupportedVersion` / `UnsupportedAlgorithm` for envelopes from another writer.
/// * `MalformedEnvelope` if the envelope parses but its fields are unusable.
/// * `AuthenticationFailure` if the tag does not verify (tampering or wrong key).
#[allow(deprecated)]
pub fn decrypt(envelope: &str, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let raw = parse(envelope)?;

    if raw.version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(raw.version));
    }
    if raw.algorithm != ALGORITHM_ID {
        return Err(CryptoError::UnsupportedAlgorithm(raw.algorithm));
    }

    let nonce = decode_component(&raw.nonce, "nonce is not base64")?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::MalformedEnvelope("nonce has the wrong length"));
    }
    let tag = decode_component(&raw.tag, "tag is not base64")?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::MalformedEnvelope("tag has the wrong length"));
    }
    let mut sealed = decode_component(&raw.ciphertext, "ciphertext is not base64")?;
    sealed.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|_| CryptoError::MalformedEnvelope("invalid key length"))?;

    cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// Structural check only; says nothing about whether the envelope would verify.
#[must_use]
pub fn is_envelope(value: &str) -> bool {
    parse(value).is_ok()
}

fn parse(envelope: &str) -> Result<RawEnvelope, CryptoError> {
    let outer = Base64::decode_vec(envelope).map_err(|_| CryptoError::FormatMismatch)?;
    let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(&outer) else {
        return Err(CryptoError::FormatMismatch);
    };

    let text = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_owned);

    match (
        fields.get("v").and_then(Value::as_u64),
        text("alg"),
        text("iv"),
        text("ct"),
        text("tag"),
    ) {
        (Some(version), Some(algorithm), Some(nonce), Some(ciphertext), Some(tag)) => {
            Ok(RawEnvelope {
                version,
                algorithm,
                nonce,
                ciphertext,
                tag,
            })
        }
        _ => Err(CryptoError::FormatMismatch),
    }
}

fn decode_component(value: &str, reason: &'static str) -> Result<Vec<u8>, CryptoError> {
    Base64::decode_vec(value).map_err(|_| CryptoError::MalformedEnvelope(reason))
}
