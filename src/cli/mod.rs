use clap::{Parser, Subcommand};

pub mod config;
pub mod run;
pub mod version;

#[derive(Parser)]
#[command(name = "psigrid")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "PSI handshake orchestration service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service: JSON envelopes in on stdin, replies out on stdout
    Run {
        /// Path to the TOML config file (defaults to the platform data dir)
        #[arg(long)]
        config: Option<String>,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { config } => run::execute(config).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
