//! Synapse MCP OAuth proxy - Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use synapse_mcp::{AuthMode, config::Config, server::McpServer, server::oauth::create_oauth_proxy};

#[derive(Parser, Debug)]
#[command(name = "synapse-mcp")]
#[command(about = "Session-aware OAuth proxy for the Synapse MCP server")]
#[command(version)]
struct Cli {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "HOST")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "9000", env = "PORT")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable debug logging (overrides --log-level)
    #[arg(long)]
    debug: bool,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

/// OAuth wins over a PAT; having neither is a startup error.
async fn select_auth_mode(config: &Config) -> anyhow::Result<AuthMode> {
    if let Some(proxy) = create_oauth_proxy(config).await? {
        tracing::info!("Server configured for OAuth authentication (production mode)");
        if config.pat.is_some() {
            tracing::warn!(
                "Both SYNAPSE_PAT and OAuth credentials detected. Using OAuth; \
                 remove SYNAPSE_OAUTH_CLIENT_ID/SECRET to use PAT mode"
            );
        }
        return Ok(AuthMode::OAuth(Arc::new(proxy)));
    }

    if let Some(pat) = config.pat.clone() {
        tracing::info!("Server configured for PAT authentication (development mode)");
        return Ok(AuthMode::Pat(pat));
    }

    anyhow::bail!(
        "No authentication configured. Set one of:\n  \
         Production (OAuth): SYNAPSE_OAUTH_CLIENT_ID + SYNAPSE_OAUTH_CLIENT_SECRET\n  \
         Development (PAT):  SYNAPSE_PAT"
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    init_tracing(&log_level.to_ascii_lowercase(), cli.json_logs);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Synapse MCP server");

    let config = Config::from_env()?;
    tracing::debug!(?config, "Loaded configuration");

    let auth = select_auth_mode(&config).await?;
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;

    McpServer::new(config, auth).run_http(addr).await
}
