//! Session-aware OAuth 2.0 proxy in front of the Synapse identity provider.
//!
//! MCP clients see a regular authorization server; every login is delegated
//! to Synapse and the resulting upstream token is remembered per user so the
//! connection layer can act on that user's behalf.
//!
//! ## Supported Standards
//! - RFC 9728: OAuth Protected Resource Metadata
//! - RFC 8414: OAuth Authorization Server Metadata
//! - RFC 7591: Dynamic Client Registration
//! - RFC 7636: PKCE (S256)
//! - RFC 6749: Authorization Code Grant

pub mod base;
pub mod callback;
pub mod handlers;
pub mod jwt;
pub mod pkce;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod token_cache;
pub mod types;
pub mod upstream;
pub mod user_tokens;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

pub use base::{OAuthProxy, ProxySettings};
pub use jwt::{JwtVerifier, JwtVerifierConfig, TokenVerifier, extract_subject_unverified};
pub use proxy::{CleanupPolicy, MappingReport, SessionAwareProxy};
pub use registry::{ClientRegistry, FileClientRegistry, InMemoryClientRegistry};
pub use store::OAuthStore;
pub use token_cache::TokenCache;
pub use user_tokens::{MokaUserTokenStore, UserTokenStore};

use crate::config::Config;

/// Build the session-aware proxy from configuration.
///
/// Returns `Ok(None)` when no upstream client credentials are configured.
///
/// # Errors
///
/// Returns error if the static client list is invalid, the registry cannot
/// be read, or an HTTP client cannot be created.
pub async fn create_oauth_proxy(config: &Config) -> anyhow::Result<Option<SessionAwareProxy>> {
    let Some(verifier_config) = JwtVerifierConfig::from_config(config) else {
        return Ok(None);
    };
    let Some(upstream) = upstream::UpstreamClient::from_config(config)? else {
        return Ok(None);
    };

    info!(
        synapse_env = config.synapse_env.as_str(),
        issuer = %config.endpoints.issuer,
        "Configuring OAuth for Synapse environment"
    );

    let verifier = Arc::new(JwtVerifier::new(verifier_config)?);
    let base = OAuthProxy::new(
        OAuthStore::default(),
        upstream,
        verifier,
        ProxySettings::from_config(config),
    );

    let static_clients = config
        .static_clients
        .as_deref()
        .map(registry::parse_static_clients)
        .transpose()
        .context("SYNAPSE_MCP_STATIC_CLIENTS is invalid")?
        .unwrap_or_default();

    let registry: Arc<dyn ClientRegistry> = match &config.client_registry_path {
        Some(path) => {
            info!(path = %path.display(), "Persisting dynamic clients to file");
            Arc::new(FileClientRegistry::new(path))
        }
        None => Arc::new(InMemoryClientRegistry::new()),
    };

    let proxy = SessionAwareProxy::builder(base)
        .registry(registry)
        .user_tokens(Arc::new(MokaUserTokenStore::new()))
        .static_clients(static_clients)
        .user_token_ttl(config.user_token_ttl)
        .cleanup_policy(CleanupPolicy::MinAge(config.token_cleanup_min_age))
        .build()
        .await
        .context("failed to load client registry")?;

    Ok(Some(proxy))
}
