//! Process-wide session encryption key.
//!
//! The key is derived once at startup from an operator supplied secret and
//! shared by reference for the lifetime of the process. It is never written
//! anywhere and its `Debug` output is redacted.

use base64ct::{Base64, Base64Unpadded, Base64Url, Base64UrlUnpadded, Encoding};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use tracing::warn;

pub const KEY_LEN: usize = 32;

/// Secret used when no key material is configured in development.
const DEVELOPMENT_SECRET: &str = "dev-secret-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("no encryption key or session secret configured; refusing to start outside development")]
    MissingSecret,
}

/// Deployment mode, only used to decide whether a missing secret is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Production => f.write_str("production"),
        }
    }
}

/// Where the active key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    EncryptionKey,
    SessionSecret,
    DevelopmentFallback,
}

/// 256-bit AES key for session envelopes.
pub struct SessionKey(SecretBox<[u8; KEY_LEN]>);

impl SessionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    /// Derive a key from an arbitrary secret.
    ///
    /// A secret that is base64 (standard or URL-safe, padded or not) for
    /// exactly `KEY_LEN` bytes is used as-is, anything else is hashed with
    /// SHA-256.
    #[must_use]
    pub fn derive(secret: &SecretString) -> Self {
        let secret = secret.expose_secret();

        if let Some(bytes) = decode_raw_key(secret.trim()) {
            return Self::from_bytes(bytes);
        }

        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        Self::from_bytes(hasher.finalize().into())
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }
}

fn decode_raw_key(encoded: &str) -> Option<[u8; KEY_LEN]> {
    [
        Base64::decode_vec(encoded),
        Base64Unpadded::decode_vec(encoded),
        Base64Url::decode_vec(encoded),
        Base64UrlUnpadded::decode_vec(encoded),
    ]
    .into_iter()
    .flatten()
    .find_map(|decoded| <[u8; KEY_LEN]>::try_from(decoded.as_slice()).ok())
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(***)")
    }
}

/// Pick the key material for this process.
///
/// # Errors
/// Returns `KeyError::MissingSecret` when nothing is configured outside development.
pub fn resolve_key(
    encryption_key: Option<&SecretString>,
    session_secret: Option<&SecretString>,
    environment: Environment,
) -> Result<(SessionKey, KeySource), KeyError> {
    fn configured(secret: Option<&SecretString>) -> Option<&SecretString> {
        secret.filter(|value| !value.expose_secret().trim().is_empty())
    }

    if let Some(key) = configured(encryption_key) {
        return Ok((SessionKey::derive(key), KeySource::EncryptionKey));
    }

    if let Some(secret) = configured(session_secret) {
        warn!("No dedicated encryption key configured, deriving it from the session secret");
        return Ok((SessionKey::derive(secret), KeySource::SessionSecret));
    }

    match environment {
        Environment::Development => {
            warn!(
                "SECURITY: no encryption key configured, using the built-in development key. \
                 Sessions are NOT protected; never run like this in production"
            );
            let fallback = SecretString::from(DEVELOPMENT_SECRET.to_string());
            Ok((SessionKey::derive(&fallback), KeySource::DevelopmentFallback))
        }
        Environment::Production => Err(KeyError::MissingSecret),
    }
}
