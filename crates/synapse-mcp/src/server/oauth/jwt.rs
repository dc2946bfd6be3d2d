//! Bearer token verification against the upstream IdP's JWKS.
//!
//! - RS256 only
//! - issuer and audience (this proxy's upstream client id) checked
//! - token scopes must be a superset of the required scopes
//! - signing keys cached; a `kid` miss refreshes the set behind a
//!   single-flight lock and a minimum refresh interval
//! - JWKS fetches use a bounded timeout and fail closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::types::VerifiedAccessToken;
use crate::config::Config;
use crate::error::{VerificationError, VerificationErrorKind};

/// Allowed clock skew when checking `exp`/`nbf`, in seconds.
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// Anything that can turn a bearer token into a [`VerifiedAccessToken`].
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<VerifiedAccessToken, VerificationError>;

    /// Scopes every accepted token must carry.
    fn required_scopes(&self) -> &[String];
}

/// Verifier settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct JwtVerifierConfig {
    pub jwks_uri: String,
    pub issuer: String,
    pub audience: String,
    pub required_scopes: Vec<String>,
    pub fetch_timeout: Duration,
    pub cache_ttl: Duration,
    pub min_refresh_interval: Duration,
}

impl JwtVerifierConfig {
    /// Returns `None` when OAuth is not configured.
    #[must_use]
    pub fn from_config(config: &Config) -> Option<Self> {
        let oauth = config.oauth.as_ref()?;
        Some(Self {
            jwks_uri: config.endpoints.jwks_uri.clone(),
            issuer: config.endpoints.issuer.clone(),
            audience: oauth.client_id.clone(),
            required_scopes: config.required_scopes.clone(),
            fetch_timeout: config.jwks_timeout,
            cache_ttl: config.jwks_cache_ttl,
            min_refresh_interval: config.jwks_min_refresh_interval,
        })
    }
}

struct CachedJwks {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// JWKS fetcher with a shared key cache.
pub struct JwksClient {
    jwks_uri: String,
    http: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
    /// Serializes refreshes so a burst of `kid` misses costs one fetch.
    refresh_lock: Mutex<()>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    fetches: AtomicU64,
    /// Fetch attempts that have finished, successful or not.
    completed: AtomicU64,
    /// When the most recent fetch attempt failed; cleared on success.
    last_failure: RwLock<Option<Instant>>,
}

impl JwksClient {
    /// Create a JWKS client.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(
        jwks_uri: impl Into<String>,
        fetch_timeout: Duration,
        cache_ttl: Duration,
        min_refresh_interval: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .connect_timeout(fetch_timeout)
            .build()?;

        Ok(Self {
            jwks_uri: jwks_uri.into(),
            http,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            cache_ttl,
            min_refresh_interval,
            fetches: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            last_failure: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Number of JWKS fetches performed so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Resolve the decoding key for a token's `kid`.
    ///
    /// Without a `kid`, a set holding exactly one key is used. Callers that
    /// queued behind an in-flight fetch share its outcome instead of
    /// fetching again, whether it succeeded or failed.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, VerificationError> {
        if let Some(key) = self.cached_key(kid).await? {
            return Ok(key);
        }

        let generation = self.completed.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(key) = self.cached_key(kid).await? {
            return Ok(key);
        }

        if self.completed.load(Ordering::Acquire) != generation {
            return Err(self.shared_failure(kid).await);
        }

        if self.fetched_within(self.min_refresh_interval).await
            || self.failed_within(self.min_refresh_interval).await
        {
            return Err(self.shared_failure(kid).await);
        }

        let fetched = self.fetch().await;
        let outcome = match fetched {
            Ok(jwks) => {
                let key = Self::select_key(&jwks, kid);
                *self.cache.write().await = Some(CachedJwks { jwks, fetched_at: Instant::now() });
                *self.last_failure.write().await = None;
                key
            }
            Err(e) => {
                *self.last_failure.write().await = Some(Instant::now());
                Err(e)
            }
        };
        self.completed.fetch_add(1, Ordering::Release);

        outcome?.ok_or_else(|| {
            VerificationError::key_unavailable(format!("no signing key for kid {kid:?}"))
        })
    }

    async fn shared_failure(&self, kid: Option<&str>) -> VerificationError {
        if self.last_failure.read().await.is_some() {
            VerificationError::key_unavailable("JWKS endpoint unavailable")
        } else {
            VerificationError::key_unavailable(format!("no signing key for kid {kid:?}"))
        }
    }

    async fn cached_key(&self, kid: Option<&str>) -> Result<Option<DecodingKey>, VerificationError> {
        let cache = self.cache.read().await;
        match cache.as_ref() {
            Some(cached) if cached.fetched_at.elapsed() < self.cache_ttl => {
                Self::select_key(&cached.jwks, kid)
            }
            _ => Ok(None),
        }
    }

    async fn fetched_within(&self, window: Duration) -> bool {
        self.cache.read().await.as_ref().is_some_and(|c| c.fetched_at.elapsed() < window)
    }

    async fn failed_within(&self, window: Duration) -> bool {
        self.last_failure.read().await.is_some_and(|at| at.elapsed() < window)
    }

    fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>, VerificationError> {
        let jwk = match kid {
            Some(kid) => jwks.find(kid),
            None if jwks.keys.len() == 1 => jwks.keys.first(),
            None => None,
        };
        jwk.map(|jwk| {
            DecodingKey::from_jwk(jwk)
                .map_err(|e| VerificationError::key_unavailable(format!("unusable JWK: {e}")))
        })
        .transpose()
    }

    async fn fetch(&self) -> Result<JwkSet, VerificationError> {
        info!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let response = self.http.get(&self.jwks_uri).send().await.map_err(|e| {
            warn!(jwks_uri = %self.jwks_uri, error = %e, "JWKS fetch failed");
            VerificationError::key_unavailable(format!("JWKS fetch failed: {e}"))
        })?;

        if !response.status().is_success() {
            warn!(jwks_uri = %self.jwks_uri, status = %response.status(), "JWKS endpoint returned error status");
            return Err(VerificationError::key_unavailable(format!(
                "JWKS endpoint returned status {}",
                response.status()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| VerificationError::key_unavailable(format!("invalid JWKS document: {e}")))?;

        debug!(key_count = jwks.keys.len(), "JWKS refreshed");
        Ok(jwks)
    }
}

impl std::fmt::Debug for JwksClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksClient")
            .field("jwks_uri", &self.jwks_uri)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

/// Scope claim in either of its common shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScopeClaim {
    Joined(String),
    List(Vec<String>),
}

impl ScopeClaim {
    fn into_scopes(self) -> Vec<String> {
        match self {
            Self::Joined(s) => s.split_whitespace().map(str::to_owned).collect(),
            Self::List(list) => list,
        }
    }
}

/// Synapse nests granted scopes under `access`.
#[derive(Debug, Deserialize)]
struct AccessClaim {
    #[serde(default)]
    scope: Option<ScopeClaim>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    azp: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    scope: Option<ScopeClaim>,
    #[serde(default)]
    scp: Option<ScopeClaim>,
    #[serde(default)]
    access: Option<AccessClaim>,
}

impl AccessTokenClaims {
    fn take_scopes(&mut self) -> Vec<String> {
        self.scope
            .take()
            .or_else(|| self.scp.take())
            .or_else(|| self.access.take().and_then(|a| a.scope))
            .map(ScopeClaim::into_scopes)
            .unwrap_or_default()
    }
}

/// JWKS-backed verifier for upstream access tokens.
#[derive(Debug)]
pub struct JwtVerifier {
    config: JwtVerifierConfig,
    jwks: JwksClient,
}

impl JwtVerifier {
    /// Create a verifier.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: JwtVerifierConfig) -> Result<Self, reqwest::Error> {
        let jwks = JwksClient::new(
            config.jwks_uri.clone(),
            config.fetch_timeout,
            config.cache_ttl,
            config.min_refresh_interval,
        )?;
        Ok(Self { config, jwks })
    }

    #[must_use]
    pub fn jwks(&self) -> &JwksClient {
        &self.jwks
    }

    /// Verify signature, issuer, audience, expiry and scopes.
    pub async fn verify(&self, token: &str) -> Result<VerifiedAccessToken, VerificationError> {
        let header = decode_header(token)
            .map_err(|e| VerificationError::malformed(format!("invalid JWT header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(VerificationError::malformed(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let key = self.jwks.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = CLOCK_SKEW_LEEWAY;

        let mut claims = decode::<AccessTokenClaims>(token, &key, &validation)?.claims;

        let scopes = claims.take_scopes();
        let missing: Vec<&str> = self
            .config
            .required_scopes
            .iter()
            .filter(|required| !scopes.contains(required))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(VerificationError::new(
                VerificationErrorKind::InsufficientScope,
                format!("missing scopes: {}", missing.join(" ")),
            ));
        }

        Ok(VerifiedAccessToken {
            raw_token: token.to_owned(),
            client_id: claims
                .client_id
                .or(claims.azp)
                .unwrap_or_else(|| self.config.audience.clone()),
            scopes,
            expires_at: claims.exp,
            sub: claims.sub,
        })
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify_token(&self, token: &str) -> Result<VerifiedAccessToken, VerificationError> {
        self.verify(token).await
    }

    fn required_scopes(&self) -> &[String] {
        &self.config.required_scopes
    }
}

#[derive(Deserialize)]
struct SubjectOnly {
    #[serde(default)]
    sub: Option<String>,
}

/// Read the `sub` claim of a JWT **without** checking its signature.
///
/// Only for tokens the proxy itself just received from the upstream token
/// endpoint over TLS, to learn which user they belong to. Never use the
/// result for an authorization decision; bearer tokens presented by clients
/// go through [`TokenVerifier::verify_token`].
pub fn extract_subject_unverified(token: &str) -> Result<String, VerificationError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VerificationError::malformed("not a compact JWT"));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| VerificationError::malformed(format!("payload is not base64url: {e}")))?;
    let claims: SubjectOnly = serde_json::from_slice(&bytes)
        .map_err(|e| VerificationError::malformed(format!("payload is not JSON: {e}")))?;

    claims
        .sub
        .filter(|s| !s.is_empty())
        .ok_or_else(|| VerificationError::malformed("token has no sub claim"))
}
