use super::{SessionError, SessionRecord};
use crate::clock::Clock;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;
use tracing::debug;

/// Persistence for session records keyed by session id.
///
/// Implementations store whatever record they are handed; encryption is
/// layered on top by [`super::EncryptedSessionStore`], which is itself a
/// backend so callers never need to know which one they hold.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError>;

    /// Insert or replace the record, expiring after `ttl`.
    async fn set(&self, sid: &str, record: &SessionRecord, ttl: Duration)
        -> Result<(), SessionError>;

    /// Remove the record. Missing ids are not an error.
    async fn destroy(&self, sid: &str) -> Result<(), SessionError>;

    /// Extend the lifetime of an existing record.
    async fn touch(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError>;

    async fn all(&self) -> Result<HashMap<String, SessionRecord>, SessionError>;

    async fn clear(&self) -> Result<(), SessionError>;

    async fn count(&self) -> Result<usize, SessionError> {
        Ok(self.all().await?.len())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: SessionRecord,
    expires_at: SystemTime,
}

/// Process-local backend for development and tests.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Prune expired entries every `every` until the task is aborted.
    pub fn spawn_pruner(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let pruned = self.prune_expired();
                if pruned > 0 {
                    debug!(pruned, "Pruned expired in-memory sessions");
                }
            }
        })
    }

    /// Raw record as stored, bypassing any decoding.
    #[must_use]
    pub fn raw(&self, sid: &str) -> Option<SessionRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(sid).map(|entry| entry.record.clone())
    }

    fn live(&self, entry: &Entry) -> bool {
        entry.expires_at > self.clock.now()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn get(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(sid)
            .filter(|entry| self.live(entry))
            .map(|entry| entry.record.clone()))
    }

    async fn set(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            sid.to_string(),
            Entry {
                record: record.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn destroy(&self, sid: &str) -> Result<(), SessionError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(sid);
        Ok(())
    }

    async fn touch(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(sid.to_string())
            .and_modify(|entry| {
                entry.record.cookie = record.cookie.clone();
                entry.expires_at = expires_at;
            })
            .or_insert_with(|| Entry {
                record: record.clone(),
                expires_at,
            });
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<String, SessionRecord>, SessionError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .filter(|(_, entry)| self.live(entry))
            .map(|(sid, entry)| (sid.clone(), entry.record.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
