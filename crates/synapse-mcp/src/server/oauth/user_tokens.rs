//! Subject -> upstream access token mapping with per-entry TTL.
//!
//! At most one live token per subject; a write supersedes the previous token
//! and restarts its TTL. Expiry is passive (checked on read by the backend);
//! `cleanup_expired_tokens` is the sweep hook for backends without native TTL.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::error::StorageResult;

/// Upper bound on concurrently mapped users held in memory.
const MAX_MAPPED_USERS: u64 = 100_000;

/// Durable, TTL-bearing store of per-user upstream tokens.
#[async_trait]
pub trait UserTokenStore: Send + Sync {
    async fn get_all_user_subjects(&self) -> StorageResult<HashSet<String>>;

    /// Reverse lookup: which subject currently owns `token`.
    async fn find_user_by_token(&self, token: &str) -> StorageResult<Option<String>>;

    /// Upsert with TTL refresh.
    async fn set_user_token(&self, subject: &str, token: &str, ttl: Duration) -> StorageResult<()>;

    async fn get_user_token(&self, subject: &str) -> StorageResult<Option<String>>;

    async fn remove_user_token(&self, subject: &str) -> StorageResult<()>;

    async fn cleanup_expired_tokens(&self) -> StorageResult<()>;
}

#[derive(Clone)]
struct Mapping {
    token: String,
    ttl: Duration,
}

/// Every write (create or update) restarts the entry's own TTL.
struct MappingExpiry;

impl Expiry<String, Mapping> for MappingExpiry {
    fn expire_after_create(
        &self,
        _subject: &String,
        mapping: &Mapping,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(mapping.ttl)
    }

    fn expire_after_update(
        &self,
        _subject: &String,
        mapping: &Mapping,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(mapping.ttl)
    }
}

/// In-process store backed by a moka cache.
#[derive(Clone)]
pub struct MokaUserTokenStore {
    cache: Cache<String, Mapping>,
}

impl MokaUserTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_MAPPED_USERS)
    }

    #[must_use]
    pub fn with_capacity(max_users: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_users).expire_after(MappingExpiry).build();
        Self { cache }
    }
}

impl Default for MokaUserTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MokaUserTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaUserTokenStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl UserTokenStore for MokaUserTokenStore {
    async fn get_all_user_subjects(&self) -> StorageResult<HashSet<String>> {
        Ok(self.cache.iter().map(|(subject, _)| subject.to_string()).collect())
    }

    async fn find_user_by_token(&self, token: &str) -> StorageResult<Option<String>> {
        Ok(self
            .cache
            .iter()
            .find(|(_, mapping)| mapping.token == token)
            .map(|(subject, _)| subject.to_string()))
    }

    async fn set_user_token(&self, subject: &str, token: &str, ttl: Duration) -> StorageResult<()> {
        self.cache
            .insert(subject.to_owned(), Mapping { token: token.to_owned(), ttl })
            .await;
        Ok(())
    }

    async fn get_user_token(&self, subject: &str) -> StorageResult<Option<String>> {
        Ok(self.cache.get(subject).await.map(|mapping| mapping.token))
    }

    async fn remove_user_token(&self, subject: &str) -> StorageResult<()> {
        self.cache.invalidate(subject).await;
        Ok(())
    }

    async fn cleanup_expired_tokens(&self) -> StorageResult<()> {
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MokaUserTokenStore::new();
        store.set_user_token("user-1", "token123", HOUR).await.unwrap();

        assert_eq!(store.get_user_token("user-1").await.unwrap().as_deref(), Some("token123"));
        assert_eq!(store.find_user_by_token("token123").await.unwrap().as_deref(), Some("user-1"));
        assert!(store.get_user_token("user-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_token_supersedes_previous() {
        let store = MokaUserTokenStore::new();
        store.set_user_token("user-1", "old", HOUR).await.unwrap();
        store.set_user_token("user-1", "new", HOUR).await.unwrap();

        assert_eq!(store.get_user_token("user-1").await.unwrap().as_deref(), Some("new"));
        assert!(store.find_user_by_token("old").await.unwrap().is_none());
        assert_eq!(store.get_all_user_subjects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MokaUserTokenStore::new();
        store.set_user_token("user-1", "token", HOUR).await.unwrap();
        store.remove_user_token("user-1").await.unwrap();
        store.remove_user_token("user-1").await.unwrap();

        assert!(store.get_user_token("user-1").await.unwrap().is_none());
        assert!(store.get_all_user_subjects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MokaUserTokenStore::new();
        store.set_user_token("short", "t1", Duration::from_millis(50)).await.unwrap();
        store.set_user_token("long", "t2", HOUR).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        store.cleanup_expired_tokens().await.unwrap();

        assert!(store.get_user_token("short").await.unwrap().is_none());
        assert!(store.find_user_by_token("t1").await.unwrap().is_none());
        assert_eq!(store.get_all_user_subjects().await.unwrap(), HashSet::from(["long".to_owned()]));
    }

    #[tokio::test]
    async fn test_rewrite_refreshes_ttl() {
        let store = MokaUserTokenStore::new();
        store.set_user_token("user-1", "t", Duration::from_millis(50)).await.unwrap();
        store.set_user_token("user-1", "t", HOUR).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get_user_token("user-1").await.unwrap().as_deref(), Some("t"));
    }
}
