//! Session record model and on-disk shape classification.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Marker set on records written by the encrypted store.
pub const ENCRYPTED_MARKER: &str = "__encrypted";
/// Field holding the sealed payload in the current shape.
pub const SEALED_PAYLOAD_FIELD: &str = "data";
/// Fields sealed one by one in the legacy per-field shape.
pub const LEGACY_SEALED_FIELDS: [&str; 2] = ["passport", "userId"];

const ORIGINAL_MAX_AGE: &str = "originalMaxAge";
const EXPIRES: &str = "expires";

/// Cookie attributes stored next to the payload, always in plaintext.
///
/// Kept as the raw JSON object so attributes written by other cookie layers
/// survive a read/write cycle untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieMetadata(Map<String, Value>);

impl CookieMetadata {
    /// Fresh metadata expiring `ttl` after `now`.
    #[must_use]
    pub fn expiring_in(now: DateTime<Utc>, ttl: Duration) -> Self {
        let mut cookie = Self::default();
        cookie.refresh(now, ttl);
        cookie
    }

    /// Move the expiry to `now + ttl`.
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires = now + ChronoDuration::milliseconds(millis);
        self.0.insert(ORIGINAL_MAX_AGE.to_string(), Value::from(millis));
        self.0.insert(
            EXPIRES.to_string(),
            Value::String(expires.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }

    #[must_use]
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        let raw = self.0.get(EXPIRES)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// Lifetime in milliseconds, as set when the cookie was issued.
    #[must_use]
    pub fn original_max_age(&self) -> Option<i64> {
        self.0.get(ORIGINAL_MAX_AGE)?.as_i64()
    }

    /// Remaining lifetime at `now`, `None` for browser-session cookies.
    #[must_use]
    pub fn ttl_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = self.expires()? - now;
        Some(remaining.to_std().unwrap_or(Duration::ZERO))
    }

    #[must_use]
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for CookieMetadata {
    fn from(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }
}

/// The logical unit stored per session id.
///
/// Serialized flat: `cookie` sits beside the payload fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub cookie: CookieMetadata,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(cookie: CookieMetadata) -> Self {
        Self {
            cookie,
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.payload.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.payload.remove(key)
    }
}

/// How a stored record was written.
#[derive(Debug, PartialEq)]
pub enum StoredShape<'a> {
    /// Whole payload sealed in one envelope under `data`.
    Sealed(&'a Value),
    /// Marker present, individual fields sealed.
    LegacyFields,
    /// Never encrypted.
    Plaintext,
}

#[must_use]
pub fn classify(record: &SessionRecord) -> StoredShape<'_> {
    if record.payload.get(ENCRYPTED_MARKER) != Some(&Value::Bool(true)) {
        return StoredShape::Plaintext;
    }
    match record.payload.get(SEALED_PAYLOAD_FIELD) {
        Some(Value::Null) | None => StoredShape::LegacyFields,
        Some(data) => StoredShape::Sealed(data),
    }
}
