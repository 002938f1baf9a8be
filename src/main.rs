use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use phoenix::config::Config;
use phoenix::haven::HavenClient;
use phoenix::server::{self, Server};

fn init_logging(debug_mode: bool) {
    let default_filter = if debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(config.debug_mode);

    tracing::info!(
        "Starting agent server (project: {}, haven: {})",
        config.project_id,
        config.haven.address
    );

    let host = Arc::new(HavenClient::new(&config.haven));
    let server = Arc::new(Server::new(config, host)?);
    server::serve(server).await
}
