//! Authenticated encryption for session data at rest.
//!
//! [`envelope`] seals byte strings into a versioned, self-describing
//! envelope; [`fields`] applies it to named fields of a JSON record with a
//! lenient read path for records written before encryption existed.

pub mod envelope;
pub mod fields;
pub mod key;

pub use envelope::{decrypt, encrypt, is_envelope};
pub use fields::{decrypt_fields, encrypt_fields};
pub use key::{resolve_key, Environment, KeyError, KeySource, SessionKey};

/// Every way sealing or opening an envelope can go wrong.
///
/// `FormatMismatch` is not a failure of the cipher: it says the input is not
/// an envelope at all, which lenient callers read as legacy plaintext.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailure(String),
    #[error("envelope authentication failed")]
    AuthenticationFailure,
    #[error("unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u64),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("value is not an encrypted envelope")]
    FormatMismatch,
}
