mod handlers;
mod state;

use crate::state::AppState;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tablestore=debug,tower_http=info")),
        )
        .init();

    let state = AppState::new();

    // router HTTP
    let app = handlers::build_router(state);

    let addr = std::env::var("STORE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("tablestore escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
