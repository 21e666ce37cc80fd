//! # sealed-session
//!
//! Server-side sessions whose payload is sealed with AES-256-GCM before it
//! reaches storage, plus the two guards that usually sit next to a session
//! layer: synchronizer CSRF tokens and fixed-window rate limiting.
//!
//! ## Encryption at rest
//!
//! [`session::EncryptedSessionStore`] wraps any [`session::SessionBackend`].
//! The cookie metadata stays readable for the backend; everything else is
//! sealed into one versioned envelope. Records written before encryption
//! existed are still readable and are upgraded the next time they are saved.
//! A record that claims to be sealed but fails to open is destroyed and the
//! request continues without a session.
//!
//! ## CSRF
//!
//! Safe requests receive a fresh token; mutating requests must echo it in the
//! `x-csrf-token` header or a `csrfToken` body field. Tokens are single use
//! and expire.
//!
//! ## Rate limiting
//!
//! Per-client counters over a fixed window, with a block period once the
//! limit is exceeded. State is in-process only.

pub mod api;
pub mod cli;
pub mod clock;
pub mod crypto;
pub mod guard;
pub mod session;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }
}
