// src/main.rs

use std::sync::Arc;

use llm_council::council::config::JsonConfigStore;
use llm_council::council::providers::DefaultProviderFactory;
use llm_council::council::server::{router, AppState};
use llm_council::council::store::JsonFileStore;

#[tokio::main]
async fn main() {
    env_logger::init();

    let data_dir =
        std::env::var("COUNCIL_DATA_DIR").unwrap_or_else(|_| "data/conversations".to_string());
    let host = std::env::var("COUNCIL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("COUNCIL_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8001);

    let state = AppState::new(
        Arc::new(JsonFileStore::new(&data_dir)),
        Arc::new(JsonConfigStore::new(&data_dir)),
        Arc::new(DefaultProviderFactory),
    );
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("could not bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    log::info!("LLM Council API listening on {} (data dir: {})", addr, data_dir);
    if let Err(e) = axum::serve(listener, app).await {
        log::error!("server error: {}", e);
        std::process::exit(1);
    }
}
