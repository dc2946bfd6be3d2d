//! Configuration for the Synapse MCP OAuth proxy.
//!
//! Everything is read once at startup from the environment (optionally
//! seeded from a `.env` file by the binary).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Defaults and fixed protocol values.
pub mod defaults {
    use std::time::Duration;

    /// Public URL of this server when `MCP_SERVER_URL` is unset.
    pub const SERVER_URL: &str = "http://127.0.0.1:9000";

    /// Path of the upstream callback on this server.
    pub const REDIRECT_PATH: &str = "/oauth/callback";

    /// Scopes every upstream token must carry.
    pub const REQUIRED_SCOPES: &[&str] = &["openid", "view"];

    /// Lifetime of a subject -> token mapping (1 hour).
    pub const USER_TOKEN_TTL: Duration = Duration::from_secs(3600);

    /// Minimum age before an unmapped cached token may be evicted (5 minutes).
    pub const TOKEN_CLEANUP_MIN_AGE: Duration = Duration::from_secs(300);

    /// Period of the background cleanup task.
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

    /// JWKS request timeout.
    pub const JWKS_TIMEOUT: Duration = Duration::from_secs(5);

    /// How long a fetched key set is trusted.
    pub const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

    /// Minimum spacing between JWKS refetches triggered by unknown key ids.
    pub const JWKS_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

    /// Upstream token endpoint request timeout.
    pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

    /// Dynamic registrations accepted per minute.
    pub const REGISTRATIONS_PER_MINUTE: u32 = 30;
}

/// Synapse deployment the proxy authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynapseEnv {
    #[default]
    Prod,
    Staging,
    Dev,
}

impl SynapseEnv {
    /// Parse `SYNAPSE_ENV`; unknown values fall back to production.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "staging" => Self::Staging,
            "dev" => Self::Dev,
            "prod" => Self::Prod,
            other => {
                tracing::warn!(value = %other, "Unknown SYNAPSE_ENV, using prod");
                Self::Prod
            }
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Staging => "staging",
            Self::Dev => "dev",
        }
    }

    /// Upstream OAuth endpoints for this deployment.
    #[must_use]
    pub fn endpoints(self) -> UpstreamEndpoints {
        let (repo, signin) = match self {
            Self::Prod => ("https://repo-prod.prod.sagebase.org", "https://signin.synapse.org"),
            Self::Staging => {
                ("https://repo-staging.prod.sagebase.org", "https://signin.synapse.org")
            }
            Self::Dev => ("https://repo-dev.dev.sagebase.org", "https://dev-signin.synapse.org"),
        };
        UpstreamEndpoints {
            authorization_endpoint: signin.to_owned(),
            token_endpoint: format!("{repo}/auth/v1/oauth2/token"),
            jwks_uri: format!("{repo}/auth/v1/oauth2/jwks"),
            issuer: format!("{repo}/auth/v1"),
        }
    }
}

/// Upstream identity provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub issuer: String,
}

/// This proxy's own upstream OAuth client credentials.
#[derive(Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSettings").field("client_id", &self.client_id).finish()
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct Config {
    /// Upstream client credentials; `None` when OAuth is not configured.
    pub oauth: Option<OAuthSettings>,

    /// Personal access token for single-user development mode.
    pub pat: Option<String>,

    pub synapse_env: SynapseEnv,

    pub endpoints: UpstreamEndpoints,

    /// Public URL of this server, without a trailing slash.
    pub server_url: String,

    /// Path of the upstream callback on this server.
    pub redirect_path: String,

    pub required_scopes: Vec<String>,

    /// Raw JSON array of pre-shared client registrations.
    pub static_clients: Option<String>,

    /// Registry file for dynamic clients; in-memory when unset.
    pub client_registry_path: Option<PathBuf>,

    pub user_token_ttl: Duration,

    pub token_cleanup_min_age: Duration,

    pub cleanup_interval: Duration,

    pub jwks_timeout: Duration,

    pub jwks_cache_ttl: Duration,

    pub jwks_min_refresh_interval: Duration,

    pub upstream_timeout: Duration,

    pub registrations_per_minute: u32,
}

impl Config {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if environment variables are invalid.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let oauth = match (get("SYNAPSE_OAUTH_CLIENT_ID"), get("SYNAPSE_OAUTH_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(OAuthSettings { client_id, client_secret }),
            _ => None,
        };

        let synapse_env = get("SYNAPSE_ENV").map(|v| SynapseEnv::parse(&v)).unwrap_or_default();

        let server_url = get("MCP_SERVER_URL")
            .unwrap_or_else(|| defaults::SERVER_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        url::Url::parse(&server_url)
            .with_context(|| format!("MCP_SERVER_URL is not a valid URL: {server_url}"))?;

        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            get(key).map_or(Ok(default), |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'"))
            })
        };

        Ok(Self {
            oauth,
            pat: get("SYNAPSE_PAT"),
            synapse_env,
            endpoints: synapse_env.endpoints(),
            server_url,
            redirect_path: defaults::REDIRECT_PATH.to_owned(),
            required_scopes: defaults::REQUIRED_SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            static_clients: get("SYNAPSE_MCP_STATIC_CLIENTS"),
            client_registry_path: get("SYNAPSE_MCP_CLIENT_REGISTRY_PATH").map(PathBuf::from),
            user_token_ttl: secs("SYNAPSE_MCP_USER_TOKEN_TTL_SECS", defaults::USER_TOKEN_TTL)?,
            token_cleanup_min_age: secs(
                "SYNAPSE_MCP_TOKEN_CLEANUP_MIN_AGE_SECS",
                defaults::TOKEN_CLEANUP_MIN_AGE,
            )?,
            cleanup_interval: defaults::CLEANUP_INTERVAL,
            jwks_timeout: defaults::JWKS_TIMEOUT,
            jwks_cache_ttl: defaults::JWKS_CACHE_TTL,
            jwks_min_refresh_interval: defaults::JWKS_MIN_REFRESH_INTERVAL,
            upstream_timeout: defaults::UPSTREAM_TIMEOUT,
            registrations_per_minute: defaults::REGISTRATIONS_PER_MINUTE,
        })
    }

    /// Create a test configuration pointing every upstream endpoint at a mock server.
    #[must_use]
    pub fn for_testing(upstream_base: &str) -> Self {
        let upstream_base = upstream_base.trim_end_matches('/');
        Self {
            oauth: Some(OAuthSettings {
                client_id: "proxy-client".to_owned(),
                client_secret: "proxy-secret".to_owned(),
            }),
            pat: None,
            synapse_env: SynapseEnv::Dev,
            endpoints: UpstreamEndpoints {
                authorization_endpoint: format!("{upstream_base}/authorize"),
                token_endpoint: format!("{upstream_base}/oauth2/token"),
                jwks_uri: format!("{upstream_base}/oauth2/jwks"),
                issuer: format!("{upstream_base}/auth/v1"),
            },
            server_url: "http://localhost:9000".to_owned(),
            redirect_path: defaults::REDIRECT_PATH.to_owned(),
            required_scopes: defaults::REQUIRED_SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            static_clients: None,
            client_registry_path: None,
            user_token_ttl: defaults::USER_TOKEN_TTL,
            token_cleanup_min_age: Duration::ZERO,
            cleanup_interval: defaults::CLEANUP_INTERVAL,
            jwks_timeout: Duration::from_secs(2),
            jwks_cache_ttl: defaults::JWKS_CACHE_TTL,
            jwks_min_refresh_interval: Duration::ZERO,
            upstream_timeout: Duration::from_secs(5),
            registrations_per_minute: 1_000,
        }
    }

    /// Check if upstream OAuth credentials are configured.
    #[must_use]
    pub const fn is_oauth_configured(&self) -> bool {
        self.oauth.is_some()
    }

    /// This server's callback URL as registered with the upstream IdP.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.origin(), self.redirect_path)
    }

    /// Scheme and authority of `server_url`, i.e. the authorization server issuer.
    #[must_use]
    pub fn origin(&self) -> String {
        url::Url::parse(&self.server_url)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| self.server_url.clone())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("oauth", &self.oauth)
            .field("pat", &self.pat.as_ref().map(|_| "<redacted>"))
            .field("synapse_env", &self.synapse_env)
            .field("server_url", &self.server_url)
            .field("client_registry_path", &self.client_registry_path)
            .field("user_token_ttl", &self.user_token_ttl)
            .field("token_cleanup_min_age", &self.token_cleanup_min_age)
            .finish()
    }
}
