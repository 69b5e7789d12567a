use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use udp_chat_relay::{
    cli::{Cli, Command},
    config::{ClientConfig, RelayConfig},
    relay::Relay,
    repl,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => {
            let relay = Relay::bind(RelayConfig::from(&args)).await?;
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = repl::run_relay(relay).await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => repl::run_client(ClientConfig::from(&args)).await?,
    }

    Ok(())
}
