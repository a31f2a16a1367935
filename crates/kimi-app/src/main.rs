use std::net::SocketAddr;

use kimi_app::{AppState, build_router, config::AppConfig};
use kimi_observability::init_observability;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let _observability = init_observability("kimi-app");

    let config = AppConfig::from_env().expect("configuration must be valid");
    let state = AppState::from_config(&config).expect("configuration must be valid");
    let app = build_router(state);
    let addr: SocketAddr =
        format!("{}:{}", config.host, config.port).parse().expect("socket address must be valid");

    tracing::info!(event = "app.listening", %addr);
    let listener = tokio::net::TcpListener::bind(addr).await.expect("listener must bind");
    axum::serve(listener, app).await.expect("server must run");
}
