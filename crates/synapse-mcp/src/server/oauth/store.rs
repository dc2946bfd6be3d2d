//! In-memory state of the base authorization-code proxy.
//!
//! Holds the client table, authorization transactions waiting for the
//! upstream callback, one-time client codes, and the shared token cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use super::token_cache::TokenCache;
use super::types::{
    ClientCode, ClientRegistration, ClientSource, PendingAuthorization, RegisteredClient,
    UpstreamTokens,
};

/// Base proxy state store.
#[derive(Clone)]
pub struct OAuthStore {
    clients: Arc<RwLock<HashMap<String, RegisteredClient>>>,
    pending: Arc<RwLock<HashMap<String, PendingAuthorization>>>,
    client_codes: Arc<RwLock<HashMap<String, ClientCode>>>,
    /// Upstream refresh token -> client it was issued to.
    refresh_owners: Arc<RwLock<HashMap<String, String>>>,
    access_tokens: TokenCache,
}

impl OAuthStore {
    #[must_use]
    pub fn new(access_tokens: TokenCache) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            client_codes: Arc::new(RwLock::new(HashMap::new())),
            refresh_owners: Arc::new(RwLock::new(HashMap::new())),
            access_tokens,
        }
    }

    /// Generate a random opaque value using two UUIDs (256 bits).
    pub fn generate_token() -> String {
        format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn token_cache(&self) -> &TokenCache {
        &self.access_tokens
    }

    /// Insert a client; a static entry is never replaced by a dynamic one.
    ///
    /// Returns `false` when the insert was refused.
    pub async fn put_client(&self, source: ClientSource, registration: ClientRegistration) -> bool {
        let mut clients = self.clients.write().await;
        if source == ClientSource::Dynamic
            && clients
                .get(&registration.client_id)
                .is_some_and(|existing| existing.source == ClientSource::Static)
        {
            return false;
        }
        clients.insert(registration.client_id.clone(), RegisteredClient { source, registration });
        true
    }

    pub async fn get_client(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.read().await.get(client_id).cloned()
    }

    pub async fn remove_client(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.write().await.remove(client_id)
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Record an authorization forwarded upstream. Returns the transaction id.
    pub async fn create_pending(&self, pending: PendingAuthorization) -> String {
        let txn_id = Self::generate_token();
        self.pending.write().await.insert(txn_id.clone(), pending);
        txn_id
    }

    /// Take a pending authorization (one-time). Expired transactions yield `None`.
    pub async fn take_pending(&self, txn_id: &str) -> Option<PendingAuthorization> {
        let pending = self.pending.write().await.remove(txn_id)?;
        (!pending.is_expired()).then_some(pending)
    }

    /// Bind upstream tokens to a fresh one-time code for the client.
    pub async fn create_client_code(
        &self,
        pending: &PendingAuthorization,
        tokens: UpstreamTokens,
    ) -> String {
        let code = Self::generate_token();
        self.client_codes.write().await.insert(
            code.clone(),
            ClientCode {
                client_id: pending.client_id.clone(),
                redirect_uri: pending.redirect_uri.clone(),
                code_challenge: pending.code_challenge.clone(),
                tokens,
                created_at: Instant::now(),
                used: false,
            },
        );
        code
    }

    /// Consume a client code (one-time use).
    ///
    /// Returns the code details if valid, unused, and not expired.
    pub async fn consume_client_code(&self, code: &str) -> Option<ClientCode> {
        let mut codes = self.client_codes.write().await;
        let client_code = codes.get_mut(code)?;

        if client_code.used || client_code.is_expired() {
            return None;
        }

        client_code.used = true;
        Some(client_code.clone())
    }

    pub async fn bind_refresh_token(&self, refresh_token: &str, client_id: &str) {
        self.refresh_owners
            .write()
            .await
            .insert(refresh_token.to_owned(), client_id.to_owned());
    }

    /// Forget a refresh token binding, returning the owning client.
    pub async fn take_refresh_owner(&self, refresh_token: &str) -> Option<String> {
        self.refresh_owners.write().await.remove(refresh_token)
    }

    /// Drop expired transactions and used or expired client codes.
    pub async fn cleanup_expired(&self) {
        {
            let mut pending = self.pending.write().await;
            let before = pending.len();
            pending.retain(|_, p| !p.is_expired());
            let removed = before - pending.len();
            if removed > 0 {
                tracing::debug!(count = removed, "Cleaned up expired authorization transactions");
            }
        }

        {
            let mut codes = self.client_codes.write().await;
            let before = codes.len();
            codes.retain(|_, code| !code.used && !code.is_expired());
            let removed = before - codes.len();
            if removed > 0 {
                tracing::debug!(count = removed, "Cleaned up spent client codes");
            }
        }
    }
}

impl Default for OAuthStore {
    fn default() -> Self {
        Self::new(TokenCache::new())
    }
}

impl std::fmt::Debug for OAuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthStore").finish()
    }
}
