//! Shared cache of upstream access tokens issued through the proxy.
//!
//! The base proxy writes to it on every token exchange; the session-aware
//! proxy scans it for unmapped tokens and evicts orphans. All access goes
//! through these accessors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::types::AccessTokenRecord;

/// Lock-guarded `token -> record` map. Cloning shares the same cache.
#[derive(Clone, Default)]
pub struct TokenCache {
    tokens: Arc<RwLock<HashMap<String, AccessTokenRecord>>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, record: AccessTokenRecord) {
        self.tokens.write().await.insert(token.into(), record);
    }

    pub async fn get(&self, token: &str) -> Option<AccessTokenRecord> {
        self.tokens.read().await.get(token).cloned()
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.tokens.read().await.contains_key(token)
    }

    pub async fn remove(&self, token: &str) -> Option<AccessTokenRecord> {
        self.tokens.write().await.remove(token)
    }

    /// Point-in-time copy of every entry.
    pub async fn snapshot(&self) -> Vec<(String, AccessTokenRecord)> {
        self.tokens.read().await.iter().map(|(t, r)| (t.clone(), r.clone())).collect()
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.tokens.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish()
    }
}
