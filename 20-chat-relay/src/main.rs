use std::{io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    Relay,
    auth::{AuthGateway, FileAuthStore, MemoryAuthStore},
    cli::Cli,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let gateway: Arc<dyn AuthGateway> = match &cli.accounts {
        Some(path) => Arc::new(
            FileAuthStore::open(path)
                .with_context(|| format!("failed to open account store {}", path.display()))?,
        ),
        None => {
            warn!("no --accounts file given, accounts will not outlive this process");
            Arc::new(MemoryAuthStore::new())
        }
    };

    let relay = Relay::bind(cli.relay_config(), gateway)?;
    let addr = relay.local_addr()?;
    info!("relay listening on {}", addr);

    let reason = relay.run_until_ctrl_c().await?;
    info!(?reason, "relay stopped");

    Ok(())
}
