mod app;
mod config;
mod dispatcher;
mod document;
mod error;
mod facts;
mod memory_sync;
mod profile_store;
mod session_context;
mod signature;
mod types;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = config::Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = app::run(config).await {
        tracing::error!(error = %err, "voice fact sync server stopped");
        std::process::exit(1);
    }
}
