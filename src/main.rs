use clap::Parser;
use tracing::info;

use codeyantra_core::config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli)?;

    // Initialize logging
    codeyantra_core::util::init_logging(config.log_format);

    info!(
        "Starting CodeYantra server on {} (workspace {})",
        config.bind_addr(),
        config.root.display()
    );

    codeyantra_core::server::run_server(config).await
}
