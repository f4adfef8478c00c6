//! Artisan CI command line tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod workers;

#[derive(Parser)]
#[command(name = "artisan")]
#[command(about = "Run CI jobs on local, SSH and remote workers", long_about = None)]
struct Cli {
    /// Project configuration file
    #[arg(long, env = "ARTISAN_CONFIG", default_value = "artisan.kdl")]
    config: String,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the project configuration
    Validate,
    /// Run jobs from the configuration on its workers
    Run {
        /// Only run the named job (repeatable)
        #[arg(long = "job")]
        jobs: Vec<String>,
        /// What started the build
        #[arg(long, default_value = "manual")]
        trigger: String,
    },
    /// Run a single command on a worker
    Exec {
        /// Worker to run on; the local machine by default
        #[arg(long)]
        worker: Option<String>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Serve this machine as a remote worker
    Agent {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Run { jobs, trigger } => {
            let success = commands::run::run(&cli.config, &jobs, &trigger).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Exec {
            worker,
            timeout,
            command,
        } => {
            let status = commands::exec::exec(&cli.config, worker.as_deref(), timeout, command).await?;
            std::process::exit(commands::exec::process_exit_code(status));
        }
        Commands::Agent { listen } => {
            commands::agent(&cli.config, listen).await?;
        }
    }

    Ok(())
}
