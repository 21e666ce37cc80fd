use super::{
    record::{classify, StoredShape, ENCRYPTED_MARKER, LEGACY_SEALED_FIELDS, SEALED_PAYLOAD_FIELD},
    SessionBackend, SessionError, SessionRecord,
};
use crate::crypto::{decrypt_fields, envelope, CryptoError, SessionKey};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy)]
enum Write {
    Set,
    Touch,
}

/// Backend decorator that seals session payloads before they reach storage.
///
/// Writes always produce the current shape: cookie metadata in plaintext and
/// the rest of the payload sealed into one envelope under `data`. Reads accept
/// every shape ever written, but a current-shape record that fails to open is
/// destroyed and reported as absent.
#[derive(Clone)]
pub struct EncryptedSessionStore {
    inner: Arc<dyn SessionBackend>,
    key: Arc<SessionKey>,
}

impl EncryptedSessionStore {
    #[must_use]
    pub fn new(inner: Arc<dyn SessionBackend>, key: Arc<SessionKey>) -> Self {
        Self { inner, key }
    }

    /// Current-shape record for `record`.
    ///
    /// # Errors
    /// `SessionError::Crypto` when sealing fails; nothing is written in that case.
    pub fn seal_record(&self, record: &SessionRecord) -> Result<SessionRecord, SessionError> {
        seal_with(record, |plaintext| envelope::encrypt(plaintext, &self.key))
    }

    /// Strict open of a whole-payload envelope. Any failure is fatal for the record.
    fn open_sealed_payload(&self, data: &Value) -> Result<Map<String, Value>, SessionError> {
        let sealed = data.as_str().ok_or(CryptoError::FormatMismatch)?;
        let plaintext = envelope::decrypt(sealed, &self.key)?;
        match serde_json::from_slice(&plaintext)? {
            Value::Object(mut payload) => {
                payload.remove("cookie");
                Ok(payload)
            }
            _ => Err(CryptoError::MalformedEnvelope("sealed payload is not an object").into()),
        }
    }

    /// Lenient open of the per-field shape. Fields that do not decrypt keep
    /// their stored value.
    fn open_legacy_fields(&self, stored: SessionRecord) -> SessionRecord {
        let SessionRecord { cookie, payload } = stored;
        let mut opened = decrypt_fields(&payload, &LEGACY_SEALED_FIELDS, &self.key);

        for name in LEGACY_SEALED_FIELDS {
            if opened.get(name) == payload.get(name) {
                continue;
            }
            let parsed = match opened.get(name) {
                Some(Value::String(text)) => serde_json::from_str::<Value>(text).ok(),
                _ => None,
            };
            if let Some(value) = parsed {
                opened.insert(name.to_string(), value);
            }
        }

        opened.remove(ENCRYPTED_MARKER);
        SessionRecord {
            cookie,
            payload: opened,
        }
    }

    fn open_record(&self, stored: SessionRecord) -> Result<SessionRecord, SessionError> {
        match classify(&stored) {
            StoredShape::Sealed(data) => {
                let payload = self.open_sealed_payload(data)?;
                Ok(SessionRecord {
                    cookie: stored.cookie,
                    payload,
                })
            }
            StoredShape::LegacyFields => Ok(self.open_legacy_fields(stored)),
            StoredShape::Plaintext => Ok(stored),
        }
    }

    async fn seal_and_write<F>(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
        write: Write,
        encrypt: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&[u8]) -> Result<String, CryptoError> + Send,
    {
        let sealed = match seal_with(record, encrypt) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(error = %err, operation = ?write, "Refusing to store session that failed to encrypt");
                return Err(err);
            }
        };
        match write {
            Write::Set => self.inner.set(sid, &sealed, ttl).await,
            Write::Touch => self.inner.touch(sid, &sealed, ttl).await,
        }
    }
}

fn seal_with<F>(record: &SessionRecord, encrypt: F) -> Result<SessionRecord, SessionError>
where
    F: FnOnce(&[u8]) -> Result<String, CryptoError>,
{
    let plaintext = serde_json::to_vec(&record.payload)?;
    let sealed = encrypt(&plaintext)?;

    let mut stored = SessionRecord::new(record.cookie.clone());
    stored.insert(ENCRYPTED_MARKER, true);
    stored.insert(SEALED_PAYLOAD_FIELD, sealed);
    Ok(stored)
}

#[async_trait]
impl SessionBackend for EncryptedSessionStore {
    #[instrument(skip_all, name = "session.get")]
    async fn get(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError> {
        let Some(stored) = self.inner.get(sid).await? else {
            return Ok(None);
        };

        match self.open_record(stored) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(error = %err, "Destroying session that failed to decrypt");
                if let Err(destroy_err) = self.inner.destroy(sid).await {
                    warn!(error = %destroy_err, "Failed to destroy corrupted session");
                }
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, name = "session.set")]
    async fn set(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let key = &self.key;
        self.seal_and_write(sid, record, ttl, Write::Set, |plaintext| {
            envelope::encrypt(plaintext, key)
        })
        .await
    }

    #[instrument(skip_all, name = "session.destroy")]
    async fn destroy(&self, sid: &str) -> Result<(), SessionError> {
        self.inner.destroy(sid).await
    }

    #[instrument(skip_all, name = "session.touch")]
    async fn touch(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let key = &self.key;
        self.seal_and_write(sid, record, ttl, Write::Touch, |plaintext| {
            envelope::encrypt(plaintext, key)
        })
        .await
    }

    #[instrument(skip_all, name = "session.all")]
    async fn all(&self) -> Result<HashMap<String, SessionRecord>, SessionError> {
        let stored = self.inner.all().await?;
        Ok(stored
            .into_iter()
            .filter_map(|(sid, record)| match self.open_record(record) {
                Ok(record) => Some((sid, record)),
                Err(err) => {
                    warn!(error = %err, "Skipping session that failed to decrypt");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip_all, name = "session.clear")]
    async fn clear(&self) -> Result<(), SessionError> {
        self.inner.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        session::{CookieMetadata, MemoryBackend},
    };
    use secrecy::SecretString;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(3600);

    // Envelopes written by the previous session store, keyed with sha256("interop-secret").
    const PRIOR_PASSPORT_ENVELOPE: &str = "eyJ2IjoxLCJhbGciOiJBRVMtMjU2LUdDTSIsIml2IjoiOXJWckZIYmZmcDM4RFR0cCIsImN0IjoiMzZxQkM1V3BDb0QvSVBqMm9RPT0iLCJ0YWciOiJtSFpKTkZGV0hzMXhXK0FtMVYzL093PT0ifQ==";
    const PRIOR_USER_ID_ENVELOPE: &str = "eyJ2IjoxLCJhbGciOiJBRVMtMjU2LUdDTSIsIml2IjoiTzlENFpleFE4MXBIbHljMiIsImN0IjoiOUpWUUZHc21tRlk9IiwidGFnIjoiZ3BMd0ora2pvU2NnZWRBTDNSQUgxZz09In0=";

    fn setup_with_key(key: SessionKey) -> (Arc<MemoryBackend>, EncryptedSessionStore) {
        let clock = Arc::new(ManualClock::starting_at_epoch_secs(1_700_000_000));
        let inner = Arc::new(MemoryBackend::new(clock));
        let store = EncryptedSessionStore::new(inner.clone(), Arc::new(key));
        (inner, store)
    }

    fn setup() -> (Arc<MemoryBackend>, EncryptedSessionStore) {
        setup_with_key(SessionKey::from_bytes([7u8; 32]))
    }

    fn parse(value: Value) -> SessionRecord {
        serde_json::from_value(value).expect("session record")
    }

    fn authenticated() -> SessionRecord {
        parse(json!({
            "cookie": {"originalMaxAge": 3_600_000, "expires": "2024-05-01T11:00:00.000Z", "httpOnly": true, "path": "/"},
            "passport": {"user": "42"},
            "csrfToken": "abc",
            "csrfExpires": 1_700_000_000_000_i64
        }))
    }

    #[tokio::test]
    async fn set_stores_only_the_sealed_shape() -> Result<(), SessionError> {
        let (inner, store) = setup();
        let record = authenticated();
        store.set("sid", &record, TTL).await?;

        let raw = inner.raw("sid").expect("stored record");
        assert_eq!(raw.cookie, record.cookie);
        assert_eq!(raw.get(ENCRYPTED_MARKER), Some(&json!(true)));
        let data = raw.get_str(SEALED_PAYLOAD_FIELD).expect("sealed data");
        assert!(envelope::is_envelope(data));
        assert_eq!(raw.payload.len(), 2);

        assert_eq!(store.get("sid").await?, Some(record));
        Ok(())
    }

    #[tokio::test]
    async fn cookie_metadata_is_preserved_verbatim() -> Result<(), SessionError> {
        let (_, store) = setup();
        let cookie: CookieMetadata = serde_json::from_value(json!({
            "originalMaxAge": null,
            "expires": null,
            "secure": false,
            "sameSite": "lax",
            "domain": "example.com"
        }))
        .expect("cookie");
        let mut record = SessionRecord::new(cookie.clone());
        record.insert("userId", "7");

        store.set("sid", &record, TTL).await?;
        let loaded = store.get("sid").await?.expect("session");
        assert_eq!(loaded.cookie, cookie);
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_sealed_payload_fails_closed() -> Result<(), SessionError> {
        let (inner, store) = setup();
        store.set("sid", &authenticated(), TTL).await?;

        let mut raw = inner.raw("sid").expect("stored record");
        let data = raw.get_str(SEALED_PAYLOAD_FIELD).expect("sealed data").to_string();
        let mut bytes = data.into_bytes();
        let middle = bytes.len() / 2;
        bytes[middle] = if bytes[middle] == b'A' { b'B' } else { b'A' };
        raw.insert(
            SEALED_PAYLOAD_FIELD,
            String::from_utf8(bytes).expect("ascii"),
        );
        inner.set("sid", &raw, TTL).await?;

        assert_eq!(store.get("sid").await?, None);
        assert!(inner.raw("sid").is_none(), "corrupted session must be destroyed");
        assert_eq!(store.get("sid").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn session_sealed_under_another_key_fails_closed() -> Result<(), SessionError> {
        let (inner, store) = setup();
        let other = EncryptedSessionStore::new(
            inner.clone(),
            Arc::new(SessionKey::from_bytes([8u8; 32])),
        );
        other.set("sid", &authenticated(), TTL).await?;

        assert_eq!(store.get("sid").await?, None);
        assert!(inner.raw("sid").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn marker_with_garbage_data_fails_closed() -> Result<(), SessionError> {
        let (inner, store) = setup();
        let raw = parse(json!({"cookie": {}, "__encrypted": true, "data": "not an envelope"}));
        inner.set("sid", &raw, TTL).await?;

        assert_eq!(store.get("sid").await?, None);
        assert!(inner.raw("sid").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn legacy_plaintext_passes_through() -> Result<(), SessionError> {
        let (inner, store) = setup();
        let raw = parse(json!({"cookie": {"path": "/"}, "userId": "42", "views": 3}));
        inner.set("sid", &raw, TTL).await?;

        assert_eq!(store.get("sid").await?, Some(raw));
        Ok(())
    }

    #[tokio::test]
    async fn legacy_per_field_records_are_decoded() -> Result<(), SessionError> {
        let key = SessionKey::derive(&SecretString::from("interop-secret".to_string()));
        let (inner, store) = setup_with_key(key);
        let raw = parse(json!({
            "cookie": {"path": "/"},
            "__encrypted": true,
            "passport": PRIOR_PASSPORT_ENVELOPE,
            "userId": PRIOR_USER_ID_ENVELOPE,
            "views": 3
        }));
        inner.set("sid", &raw, TTL).await?;

        let loaded = store.get("sid").await?.expect("session");
        assert_eq!(
            loaded,
            parse(json!({
                "cookie": {"path": "/"},
                "passport": {"user": "42"},
                "userId": "user-7",
                "views": 3
            }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn legacy_per_field_failures_keep_stored_values() -> Result<(), SessionError> {
        let (inner, store) = setup();
        let raw = parse(json!({
            "cookie": {},
            "__encrypted": true,
            "passport": PRIOR_PASSPORT_ENVELOPE,
            "userId": "plain-user"
        }));
        inner.set("sid", &raw, TTL).await?;

        let loaded = store.get("sid").await?.expect("session");
        assert_eq!(loaded.get_str("passport"), Some(PRIOR_PASSPORT_ENVELOPE));
        assert_eq!(loaded.get_str("userId"), Some("plain-user"));
        assert!(loaded.get(ENCRYPTED_MARKER).is_none());
        assert!(inner.raw("sid").is_some(), "legacy records are never destroyed");
        Ok(())
    }

    #[tokio::test]
    async fn all_and_count_skip_corrupt_records() -> Result<(), SessionError> {
        let (inner, store) = setup();
        store.set("good", &authenticated(), TTL).await?;
        inner
            .set(
                "legacy",
                &parse(json!({"cookie": {}, "userId": "9"})),
                TTL,
            )
            .await?;
        inner
            .set(
                "corrupt",
                &parse(json!({"cookie": {}, "__encrypted": true, "data": "garbage"})),
                TTL,
            )
            .await?;

        let all = store.all().await?;
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("good"), Some(&authenticated()));
        assert!(all.contains_key("legacy"));
        assert_eq!(store.count().await?, 2);
        assert!(inner.raw("corrupt").is_some(), "enumeration is read-only");
        Ok(())
    }

    #[tokio::test]
    async fn touch_writes_the_sealed_shape() -> Result<(), SessionError> {
        let (inner, store) = setup();
        store.touch("sid", &authenticated(), TTL).await?;

        let raw = inner.raw("sid").expect("stored record");
        assert_eq!(raw.get(ENCRYPTED_MARKER), Some(&json!(true)));
        assert!(raw.get("passport").is_none());
        assert_eq!(store.get("sid").await?, Some(authenticated()));
        Ok(())
    }

    #[tokio::test]
    async fn destroy_and_clear_delegate() -> Result<(), SessionError> {
        let (inner, store) = setup();
        store.set("a", &authenticated(), TTL).await?;
        store.set("b", &authenticated(), TTL).await?;

        store.destroy("a").await?;
        store.destroy("a").await?;
        assert!(inner.raw("a").is_none());

        store.clear().await?;
        assert_eq!(store.count().await?, 0);
        Ok(())
    }

    #[derive(Debug)]
    struct CountingBackend {
        inner: MemoryBackend,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl SessionBackend for CountingBackend {
        async fn get(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError> {
            self.inner.get(sid).await
        }

        async fn set(
            &self,
            sid: &str,
            record: &SessionRecord,
            ttl: Duration,
        ) -> Result<(), SessionError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(sid, record, ttl).await
        }

        async fn destroy(&self, sid: &str) -> Result<(), SessionError> {
            self.inner.destroy(sid).await
        }

        async fn touch(
            &self,
            sid: &str,
            record: &SessionRecord,
            ttl: Duration,
        ) -> Result<(), SessionError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.touch(sid, record, ttl).await
        }

        async fn all(&self) -> Result<HashMap<String, SessionRecord>, SessionError> {
            self.inner.all().await
        }

        async fn clear(&self) -> Result<(), SessionError> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn encryption_failure_never_reaches_the_backend() {
        let clock = Arc::new(ManualClock::starting_at_epoch_secs(1_700_000_000));
        let backend = Arc::new(CountingBackend {
            inner: MemoryBackend::new(clock),
            writes: AtomicUsize::new(0),
        });
        let store = EncryptedSessionStore::new(
            backend.clone(),
            Arc::new(SessionKey::from_bytes([7u8; 32])),
        );
        let failing = |_: &[u8]| -> Result<String, CryptoError> {
            Err(CryptoError::EncryptionFailure("rng unavailable".into()))
        };

        for write in [Write::Set, Write::Touch] {
            let result = store
                .seal_and_write("sid", &authenticated(), TTL, write, failing)
                .await;
            assert!(matches!(
                result,
                Err(SessionError::Crypto(CryptoError::EncryptionFailure(_)))
            ));
        }
        assert_eq!(backend.writes.load(Ordering::SeqCst), 0);
        assert!(backend.inner.raw("sid").is_none());

        store
            .set("sid", &authenticated(), TTL)
            .await
            .expect("real key encrypts");
        assert_eq!(backend.writes.load(Ordering::SeqCst), 1);
    }
}
