mod backends;
mod cli;
mod config;
mod crm;
mod engine;
mod home;
mod ledger;
mod server;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser)]
#[command(name = "leadroute", version, about = "Least-loaded lead and deal routing for Bitrix24")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the polling loops and webhook server
    Serve,
    /// Run one assignment cycle now
    Assign {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show active agents and their open work
    Agents {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent assignments from the ledger
    Recent {
        /// Number of entries
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Agents and recent assignments at a glance
    Dashboard,
    /// Read config values
    Config {
        /// Config key (dot-separated path)
        key: String,
    },
    /// Show version information
    Version,
    /// Generate shell completions
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leadroute=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            engine::serve().await?;
        }
        Commands::Assign { json } => {
            cli::assign_once(json).await?;
        }
        Commands::Agents { json } => {
            cli::dashboard::agents(json).await?;
        }
        Commands::Recent { limit, json } => {
            cli::dashboard::recent(limit, json).await?;
        }
        Commands::Dashboard => {
            cli::dashboard::dashboard().await?;
        }
        Commands::Config { key } => {
            cli::config(&key)?;
        }
        Commands::Version => {
            cli::version();
        }
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "leadroute", &mut std::io::stdout());
        }
    }

    Ok(())
}
