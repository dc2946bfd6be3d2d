//! Session-aware OAuth proxy.
//!
//! Wraps the base [`OAuthProxy`] and adds:
//!
//! - a durable client registry (dynamic registrations survive restarts,
//!   static clients are merged in at startup and cannot be overridden)
//! - a `subject -> upstream token` mapping, maintained by rescanning the
//!   shared token cache after every token exchange
//! - sanitized client redirects after the upstream callback
//! - eviction of cached tokens that are stale and no longer mapped
//!
//! Mapping is idempotent and always rescans, so a failure between "token
//! cached" and "mapping stored" is repaired by the next scan.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::base::{AuthorizeParams, CallbackParams, OAuthProxy, TokenParams};
use super::callback::sanitize_callback_redirect;
use super::jwt::extract_subject_unverified;
use super::registry::{ClientRegistry, InMemoryClientRegistry};
use super::token_cache::TokenCache;
use super::types::{
    AccessTokenRecord, ClientRegistration, ClientSource, RegisteredClient, UpstreamTokens,
    VerifiedAccessToken,
};
use super::user_tokens::{MokaUserTokenStore, UserTokenStore};
use crate::config::defaults;
use crate::error::{ProxyResult, RegistrationError, StorageResult, VerificationError};

tokio::task_local! {
    /// Verified bearer token of the request being served, set by the auth middleware.
    static REQUEST_TOKEN: VerifiedAccessToken;
}

/// Run `fut` with `token` as the current request's verified token.
pub async fn with_request_token<F: Future>(token: VerifiedAccessToken, fut: F) -> F::Output {
    REQUEST_TOKEN.scope(token, fut).await
}

/// The verified token of the request being served, if any.
#[must_use]
pub fn current_request_token() -> Option<VerifiedAccessToken> {
    REQUEST_TOKEN.try_with(Clone::clone).ok()
}

/// Decides whether an unmapped cached token is old enough to evict.
#[derive(Clone)]
pub enum CleanupPolicy {
    /// Evict once the token has been cached for at least this long.
    MinAge(Duration),
    /// Arbitrary predicate over the cache record.
    Custom(Arc<dyn Fn(&AccessTokenRecord) -> bool + Send + Sync>),
}

impl CleanupPolicy {
    /// Wrap a predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&AccessTokenRecord) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    #[must_use]
    pub fn is_old_enough(&self, record: &AccessTokenRecord) -> bool {
        match self {
            Self::MinAge(min_age) => record.issued_at.elapsed() >= *min_age,
            Self::Custom(predicate) => predicate(record),
        }
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::MinAge(defaults::TOKEN_CLEANUP_MIN_AGE)
    }
}

impl std::fmt::Debug for CleanupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MinAge(age) => f.debug_tuple("MinAge").field(age).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Outcome of one mapping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingReport {
    /// Tokens newly mapped to a subject.
    pub mapped: usize,
    /// Tokens with no decodable `sub`; left for cleanup.
    pub skipped: usize,
    /// Tokens whose store write failed; retried on the next pass.
    pub deferred: usize,
}

/// Builder for [`SessionAwareProxy`].
pub struct SessionAwareProxyBuilder {
    base: OAuthProxy,
    registry: Arc<dyn ClientRegistry>,
    user_tokens: Arc<dyn UserTokenStore>,
    static_clients: Vec<ClientRegistration>,
    user_token_ttl: Duration,
    cleanup_policy: CleanupPolicy,
}

impl SessionAwareProxyBuilder {
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn ClientRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn user_tokens(mut self, store: Arc<dyn UserTokenStore>) -> Self {
        self.user_tokens = store;
        self
    }

    #[must_use]
    pub fn static_clients(mut self, clients: Vec<ClientRegistration>) -> Self {
        self.static_clients = clients;
        self
    }

    #[must_use]
    pub fn user_token_ttl(mut self, ttl: Duration) -> Self {
        self.user_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Load persisted, then static, registrations and build the proxy.
    ///
    /// # Errors
    ///
    /// Returns error if the registry cannot be read.
    pub async fn build(self) -> StorageResult<SessionAwareProxy> {
        let persisted = self.registry.load_all().await?;
        let mut loaded = 0usize;
        for mut registration in persisted {
            registration.normalize_grant_types();
            if let Err(e) = registration.validate() {
                warn!(client_id = %registration.client_id, error = %e, "Skipping invalid persisted client");
                continue;
            }
            if self.base.register_client(ClientSource::Dynamic, registration).await {
                loaded += 1;
            }
        }

        let static_count = self.static_clients.len();
        for registration in self.static_clients {
            self.base.register_client(ClientSource::Static, registration).await;
        }

        info!(persisted = loaded, static_clients = static_count, "Loaded OAuth clients");

        Ok(SessionAwareProxy {
            base: self.base,
            registry: self.registry,
            user_tokens: self.user_tokens,
            user_token_ttl: self.user_token_ttl,
            cleanup_policy: self.cleanup_policy,
            observed: RwLock::new(HashSet::new()),
            mapping_lock: Mutex::new(()),
        })
    }
}

/// Base proxy plus per-user token bookkeeping.
pub struct SessionAwareProxy {
    base: OAuthProxy,
    registry: Arc<dyn ClientRegistry>,
    user_tokens: Arc<dyn UserTokenStore>,
    user_token_ttl: Duration,
    cleanup_policy: CleanupPolicy,
    /// Cached tokens already handled by a mapping pass.
    observed: RwLock<HashSet<String>>,
    /// One mapping pass at a time.
    mapping_lock: Mutex<()>,
}

impl SessionAwareProxy {
    /// Start building around a base proxy. Defaults: in-memory registry,
    /// moka user token store, one hour TTL, five minute cleanup age.
    #[must_use]
    pub fn builder(base: OAuthProxy) -> SessionAwareProxyBuilder {
        SessionAwareProxyBuilder {
            base,
            registry: Arc::new(InMemoryClientRegistry::new()),
            user_tokens: Arc::new(MokaUserTokenStore::new()),
            static_clients: Vec::new(),
            user_token_ttl: defaults::USER_TOKEN_TTL,
            cleanup_policy: CleanupPolicy::default(),
        }
    }

    #[must_use]
    pub fn base(&self) -> &OAuthProxy {
        &self.base
    }

    #[must_use]
    pub fn token_cache(&self) -> &TokenCache {
        self.base.token_cache()
    }

    #[must_use]
    pub fn user_tokens(&self) -> &Arc<dyn UserTokenStore> {
        &self.user_tokens
    }

    pub async fn get_client(&self, client_id: &str) -> Option<RegisteredClient> {
        self.base.get_client(client_id).await
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.base.store().client_ids().await
    }

    /// Register a dynamic client and persist it.
    ///
    /// Grant types are normalized first. A persistence failure rolls the
    /// in-memory registration back and is returned to the caller.
    pub async fn register_client(
        &self,
        mut registration: ClientRegistration,
    ) -> Result<ClientRegistration, RegistrationError> {
        registration.normalize_grant_types();
        registration.validate()?;

        let client_id = registration.client_id.clone();
        let conflict = || RegistrationError::StaticClientConflict { client_id: client_id.clone() };

        if self
            .base
            .get_client(&client_id)
            .await
            .is_some_and(|existing| existing.source == ClientSource::Static)
        {
            return Err(conflict());
        }
        if !self.base.register_client(ClientSource::Dynamic, registration.clone()).await {
            return Err(conflict());
        }

        if let Err(e) = self.registry.save(&registration).await {
            warn!(client_id = %client_id, error = %e, "Failed to persist client registration");
            self.base.store().remove_client(&client_id).await;
            return Err(e.into());
        }

        info!(client_id = %client_id, "Registered OAuth client");
        Ok(registration)
    }

    /// Remove a dynamic client from the table and the registry.
    pub async fn remove_client(&self, client_id: &str) -> Result<(), RegistrationError> {
        if let Some(existing) = self.base.get_client(client_id).await {
            if existing.source == ClientSource::Static {
                return Err(RegistrationError::StaticClientConflict { client_id: client_id.to_owned() });
            }
        }
        self.registry.remove(client_id).await?;
        self.base.store().remove_client(client_id).await;
        Ok(())
    }

    pub async fn authorize(&self, params: &AuthorizeParams) -> ProxyResult<String> {
        self.base.authorize(params).await
    }

    /// Base callback handling, then redirect sanitization.
    pub async fn handle_idp_callback(&self, params: &CallbackParams) -> ProxyResult<String> {
        let location = self.base.handle_idp_callback(params).await?;
        Ok(sanitize_callback_redirect(&location))
    }

    /// Token endpoint; maps any new token to its user afterwards.
    pub async fn exchange_token(&self, params: &TokenParams) -> ProxyResult<UpstreamTokens> {
        let tokens = self.base.exchange_token(params).await?;
        self.map_new_tokens_to_users().await;
        Ok(tokens)
    }

    pub async fn verify_token(&self, token: &str) -> Result<VerifiedAccessToken, VerificationError> {
        self.base.verify_token(token).await
    }

    /// Map every cached token not seen before to the subject it was issued for.
    ///
    /// Tokens are visited oldest first, so when a subject has several new
    /// tokens the newest one ends up mapped.
    pub async fn map_new_tokens_to_users(&self) -> MappingReport {
        let _pass = self.mapping_lock.lock().await;
        let mut report = MappingReport::default();

        let mut candidates = {
            let observed = self.observed.read().await;
            let mut snapshot = self.token_cache().snapshot().await;
            snapshot.retain(|(token, _)| !observed.contains(token));
            snapshot
        };
        candidates.sort_by_key(|(_, record)| record.issued_at);

        for (token, record) in candidates {
            match self.user_tokens.find_user_by_token(&token).await {
                Ok(Some(_)) => {
                    self.observed.write().await.insert(token);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Reverse token lookup failed, will retry");
                    report.deferred += 1;
                    continue;
                }
            }

            let subject = match extract_subject_unverified(&token) {
                Ok(subject) => subject,
                Err(e) => {
                    info!(client_id = %record.client_id, reason = %e.message, "MappingSkipped: no subject in token");
                    self.observed.write().await.insert(token);
                    report.skipped += 1;
                    continue;
                }
            };

            match self.user_tokens.set_user_token(&subject, &token, self.user_token_ttl).await {
                Ok(()) => {
                    debug!(subject = %subject, client_id = %record.client_id, "Mapped token to user");
                    self.observed.write().await.insert(token);
                    report.mapped += 1;
                }
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Failed to store user token, will retry");
                    report.deferred += 1;
                }
            }
        }

        if report != MappingReport::default() {
            info!(
                mapped = report.mapped,
                skipped = report.skipped,
                deferred = report.deferred,
                "Token mapping pass complete"
            );
        }
        report
    }

    /// The upstream token of the user behind the current request, as `(token, subject)`.
    ///
    /// Inside a request the verified bearer token decides the user. Outside
    /// one (single-user tooling) the only mapped user is used, and only when
    /// there is exactly one.
    pub async fn get_token_for_current_user(&self) -> StorageResult<Option<(String, String)>> {
        if let Some(current) = current_request_token() {
            if let Some(subject) = self.user_tokens.find_user_by_token(&current.raw_token).await? {
                return self.live_pair(subject).await;
            }
            return match current.sub {
                Some(subject) => self.live_pair(subject).await,
                None => Ok(None),
            };
        }

        let subjects = self.user_tokens.get_all_user_subjects().await?;
        if subjects.len() != 1 {
            return Ok(None);
        }
        match subjects.into_iter().next() {
            Some(subject) => self.live_pair(subject).await,
            None => Ok(None),
        }
    }

    async fn live_pair(&self, subject: String) -> StorageResult<Option<(String, String)>> {
        Ok(self.user_tokens.get_user_token(&subject).await?.map(|token| (token, subject)))
    }

    /// Snapshot of live `(subject, token)` mappings, ordered by subject.
    pub async fn iter_user_tokens(&self) -> StorageResult<Vec<(String, String)>> {
        let mut subjects: Vec<String> =
            self.user_tokens.get_all_user_subjects().await?.into_iter().collect();
        subjects.sort();

        let mut pairs = Vec::with_capacity(subjects.len());
        for subject in subjects {
            // May have expired since the subject listing.
            if let Some(token) = self.user_tokens.get_user_token(&subject).await? {
                pairs.push((subject, token));
            }
        }
        Ok(pairs)
    }

    /// Whether an unmapped cache entry may be evicted.
    #[must_use]
    pub fn is_token_old_enough_to_cleanup(&self, record: &AccessTokenRecord) -> bool {
        self.cleanup_policy.is_old_enough(record)
    }

    /// Evict cached tokens that are old enough and have no live mapping.
    ///
    /// A store failure means nothing is evicted this cycle. Returns the
    /// number of evicted tokens.
    pub async fn cleanup_expired_tokens(&self) -> usize {
        let live: HashSet<String> = match self.iter_user_tokens().await {
            Ok(pairs) => pairs.into_iter().map(|(_, token)| token).collect(),
            Err(e) => {
                warn!(error = %e, "Skipping token cleanup, user token store unavailable");
                return 0;
            }
        };

        let cache = self.token_cache();
        let mut evicted = 0usize;
        for (token, record) in cache.snapshot().await {
            if live.contains(&token) || !self.is_token_old_enough_to_cleanup(&record) {
                continue;
            }
            if cache.remove(&token).await.is_some() {
                evicted += 1;
            }
        }

        let remaining: HashSet<String> = cache.tokens().await.into_iter().collect();
        self.observed.write().await.retain(|token| remaining.contains(token));

        if evicted > 0 {
            info!(count = evicted, "Evicted orphaned upstream tokens");
        }
        evicted
    }

    /// One maintenance cycle: map stragglers, sweep the store, evict orphans,
    /// drop expired transactions and codes.
    pub async fn run_maintenance(&self) {
        self.map_new_tokens_to_users().await;
        if let Err(e) = self.user_tokens.cleanup_expired_tokens().await {
            warn!(error = %e, "User token store sweep failed");
        }
        self.cleanup_expired_tokens().await;
        self.base.store().cleanup_expired().await;
    }

    /// Start background maintenance on a fixed interval.
    pub fn start_cleanup_task(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.run_maintenance().await;
            }
        })
    }
}

impl std::fmt::Debug for SessionAwareProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAwareProxy")
            .field("base", &self.base)
            .field("user_token_ttl", &self.user_token_ttl)
            .field("cleanup_policy", &self.cleanup_policy)
            .finish()
    }
}
