//! Synapse MCP OAuth proxy
//!
//! An OAuth 2.0 authorization-code proxy that lets many MCP clients log in
//! through the Synapse identity provider at the same time, and keeps one
//! upstream token per user so downstream calls are made as that user.
//!
//! # Features
//!
//! - **Dynamic client registration** persisted across restarts, plus static clients
//! - **Per-user token mapping** with TTL, keyed by the token's `sub`
//! - **JWT verification** against the upstream JWKS (RS256)
//! - **Orphan cleanup** of cached tokens no user owns anymore
//!
//! # Example
//!
//! ```no_run
//! use synapse_mcp::{config::Config, server::oauth::create_oauth_proxy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     if let Some(proxy) = create_oauth_proxy(&config).await? {
//!         let current = proxy.get_token_for_current_user().await?;
//!         println!("mapped: {}", current.is_some());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod server;

pub use config::Config;
pub use connection::{AuthMode, DownstreamCredentials, resolve_credentials};
pub use error::{ProxyError, RegistrationError, StorageError, VerificationError};
pub use server::oauth::SessionAwareProxy;
