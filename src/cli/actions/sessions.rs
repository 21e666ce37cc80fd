//! Maintenance commands over the session table.

use crate::{
    crypto::{is_envelope, SessionKey},
    session::{
        classify, EncryptedSessionStore, PgSessionBackend, SessionBackend, SessionRecord,
        StoredShape,
    },
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionsCommand {
    Count,
    List,
    Clear,
    Prune,
}

#[derive(Debug)]
pub struct Args {
    pub dsn: String,
    pub key: Arc<SessionKey>,
    pub command: SessionsCommand,
}

/// How a raw row is stored on disk.
fn storage(raw: Option<&SessionRecord>) -> &'static str {
    match raw.map(classify) {
        Some(StoredShape::Sealed(Value::String(data))) if is_envelope(data) => "sealed",
        Some(StoredShape::Sealed(_)) => "malformed",
        Some(StoredShape::LegacyFields) => "legacy-fields",
        Some(StoredShape::Plaintext) => "plaintext",
        None => "unknown",
    }
}

/// One line of `sessions list`. Payload values stay private, only the keys are shown.
fn describe(
    sid: &str,
    record: &SessionRecord,
    raw: Option<&SessionRecord>,
    now: DateTime<Utc>,
) -> Value {
    let mut keys: Vec<_> = record.payload.keys().cloned().collect();
    keys.sort();
    json!({
        "sid": sid,
        "expires": record.cookie.expires(),
        "ttl_secs": record.cookie.ttl_at(now).map(|ttl| ttl.as_secs()),
        "max_age_ms": record.cookie.original_max_age(),
        "storage": storage(raw),
        "keys": keys,
    })
}

/// Execute a sessions command.
/// # Errors
/// Returns an error if the database cannot be reached or the command fails.
pub async fn execute(args: Args) -> Result<()> {
    let pg = Arc::new(
        PgSessionBackend::connect(&args.dsn)
            .await
            .context("Failed to connect to the session database")?,
    );
    let store = EncryptedSessionStore::new(pg.clone(), args.key);

    match args.command {
        SessionsCommand::Count => {
            let count = store.count().await.context("Failed to count sessions")?;
            println!("{count}");
        }
        SessionsCommand::List => {
            let sessions = store.all().await.context("Failed to list sessions")?;
            let raw = pg.all().await.context("Failed to read raw session rows")?;
            let now = Utc::now();
            let mut ids: Vec<_> = sessions.keys().collect();
            ids.sort();
            for sid in ids {
                println!("{}", describe(sid, &sessions[sid], raw.get(sid), now));
            }
        }
        SessionsCommand::Clear => {
            store.clear().await.context("Failed to clear sessions")?;
            println!("cleared");
        }
        SessionsCommand::Prune => {
            let pruned = pg.prune_expired().await?;
            println!("{pruned}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::encrypt, session::CookieMetadata};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .expect("time")
            .with_timezone(&Utc)
    }

    fn raw(value: Value) -> SessionRecord {
        serde_json::from_value(value).expect("record")
    }

    #[test]
    fn storage_reports_each_shape() {
        let key = SessionKey::from_bytes([9u8; 32]);
        let envelope = encrypt(b"{}", &key).expect("encrypt");

        let sealed = raw(json!({"cookie": {}, "__encrypted": true, "data": envelope}));
        assert_eq!(storage(Some(&sealed)), "sealed");

        let broken = raw(json!({"cookie": {}, "__encrypted": true, "data": "garbage"}));
        assert_eq!(storage(Some(&broken)), "malformed");

        let legacy = raw(json!({"cookie": {}, "__encrypted": true, "userId": "x"}));
        assert_eq!(storage(Some(&legacy)), "legacy-fields");

        let plain = raw(json!({"cookie": {}, "userId": "42"}));
        assert_eq!(storage(Some(&plain)), "plaintext");
        assert_eq!(storage(None), "unknown");
    }

    #[test]
    fn describe_shows_keys_and_lifetime_but_not_values() {
        let mut record = SessionRecord::new(CookieMetadata::expiring_in(
            now(),
            Duration::from_secs(600),
        ));
        record.insert("userId", json!("42"));
        record.insert("csrfToken", json!("secret-token"));
        let plain = record.clone();

        let line = describe("sid-1", &record, Some(&plain), now() + chrono::Duration::seconds(60));
        assert_eq!(line["sid"], json!("sid-1"));
        assert_eq!(line["ttl_secs"], json!(540));
        assert_eq!(line["max_age_ms"], json!(600_000));
        assert_eq!(line["storage"], json!("plaintext"));
        assert_eq!(line["keys"], json!(["csrfToken", "userId"]));
        assert!(!line.to_string().contains("secret-token"));
    }
}
