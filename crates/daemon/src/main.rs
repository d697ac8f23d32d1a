// mcpd: standalone mode entry point.

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    info!(config = ?config_path, "starting standalone mcp daemon");
    mcpd_daemon::runtime::run_standalone(config_path.as_deref())
        .await
        .context("standalone daemon terminated unexpectedly")
}
