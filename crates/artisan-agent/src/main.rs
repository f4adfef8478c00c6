//! Artisan remote worker agent

use anyhow::Context;
use artisan_agent::RemoteWorkerAgent;
use artisan_core::protocol::DEFAULT_AGENT_PORT;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "artisan-agent")]
#[command(about = "Serve this machine as an Artisan worker", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "ARTISAN_AGENT_LISTEN")]
    listen: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let listen = cli
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_AGENT_PORT));
    let agent = RemoteWorkerAgent::bind(listen.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Starting agent on {}", agent.local_addr()?);

    agent
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
