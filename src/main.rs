use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use anuvad_backend::config::Config;
use anuvad_backend::routes;
use anuvad_backend::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anuvad_backend=info,tower_http=info".into()),
        )
        .init();

    let config = load_config();
    let state = AppState::new(config.clone())?;

    let app = Router::new()
        .merge(routes::create_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .with_context(|| format!("invalid listen host {:?}", config.server.host))?,
        config.server.port,
    );
    info!("starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Resolve configuration: `CONFIG_PATH`, then `conf.yaml` next to the
/// working directory, then built-in defaults.
fn load_config() -> Config {
    let candidates: Vec<String> = [std::env::var("CONFIG_PATH").ok(), Some("conf.yaml".to_string())]
        .into_iter()
        .flatten()
        .collect();

    for path in &candidates {
        match Config::load(path) {
            Ok(config) => {
                info!("loaded configuration from {}", path);
                return config;
            }
            Err(e) => {
                tracing::debug!("failed to load config from {}: {}", path, e);
            }
        }
    }

    info!("no config file found, using defaults");
    Config::default()
}
