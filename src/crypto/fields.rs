//! Field-level encryption for JSON records.
//!
//! Reads are deliberately lenient: a value that is not an envelope is treated
//! as plaintext written before encryption was enabled, and a value that fails
//! to decrypt is kept as-is. Use this only on read paths where partial
//! degradation is acceptable (audit views, legacy session fields); whole
//! session payloads go through the fail-closed path in the session store.

use super::{envelope, key::SessionKey, CryptoError};
use serde_json::{Map, Value};
use tracing::warn;

/// Replace each named, non-empty string field with its envelope.
///
/// # Errors
/// Returns the first `CryptoError::EncryptionFailure`; no partially encrypted
/// record is returned.
pub fn encrypt_fields(
    record: &Map<String, Value>,
    field_names: &[&str],
    key: &SessionKey,
) -> Result<Map<String, Value>, CryptoError> {
    let mut sealed = record.clone();
    for name in field_names {
        if let Some(Value::String(plaintext)) = record.get(*name) {
            if plaintext.is_empty() {
                continue;
            }
            let envelope = envelope::encrypt(plaintext.as_bytes(), key)?;
            sealed.insert((*name).to_string(), Value::String(envelope));
        }
    }
    Ok(sealed)
}

/// Decrypt each named field that holds an envelope, keeping everything else.
#[must_use]
pub fn decrypt_fields(
    record: &Map<String, Value>,
    field_names: &[&str],
    key: &SessionKey,
) -> Map<String, Value> {
    let mut opened = record.clone();
    for name in field_names {
        let Some(Value::String(stored)) = record.get(*name) else {
            continue;
        };
        if stored.is_empty() {
            continue;
        }

        match envelope::decrypt(stored, key) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(plaintext) => {
                    opened.insert((*name).to_string(), Value::String(plaintext));
                }
                Err(_) => warn!(field = %name, "Decrypted field is not UTF-8, keeping stored value"),
            },
            Err(CryptoError::FormatMismatch) => {}
            Err(err) => warn!(field = %name, error = %err, "Failed to decrypt field, keeping stored value"),
        }
    }
    opened
}
