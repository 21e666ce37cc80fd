//! Request guards: session-bound CSRF tokens and in-process rate limiting.

pub mod csrf;
pub mod rate_limit;

pub use csrf::{CsrfError, CsrfTokenManager};
pub use rate_limit::{Limiters, RateLimitError, RateLimitPolicy, RateLimitStatus, RateLimiter};

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};

/// 32 random bytes from the OS, URL-safe base64 without padding.
pub(crate) fn random_token() -> Result<String, rand::Error> {
    let mut bytes = [0u8; 32];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}
