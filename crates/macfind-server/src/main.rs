use std::net::SocketAddr;

use tracing::info;

use macfind_server::config::{Config, ConfigError};
use macfind_server::{app, build_state, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "macfind=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(ConfigError::PlaceholderSecret) => {
            eprintln!("FATAL: MACFIND_JWT_SECRET is unset or still a placeholder.");
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let state = build_state(&config).await?;
    let router = app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("MacFind server listening on {}", addr);
    info!("Sign-ins restricted to @{}", config.email_domain);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
