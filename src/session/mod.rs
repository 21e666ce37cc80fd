//! Session persistence.
//!
//! [`SessionBackend`] is the storage contract. [`MemoryBackend`] and
//! [`PgSessionBackend`] store records as given; [`EncryptedSessionStore`]
//! wraps either one and keeps every payload sealed at rest.

pub mod backend;
pub mod postgres;
pub mod record;
pub mod store;

pub use backend::{MemoryBackend, SessionBackend};
pub use postgres::PgSessionBackend;
pub use record::{classify, CookieMetadata, SessionRecord, StoredShape};
pub use store::EncryptedSessionStore;

use crate::crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("session serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
