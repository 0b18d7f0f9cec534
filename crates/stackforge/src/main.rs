mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stackforge")]
#[command(about = "Synthesize AWS infrastructure stacks from forge configurations", long_about = None)]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled forge and write the stack template
    Synth {
        /// Configuration file (searched for when omitted)
        #[arg(short, long, env = "STACKFORGE_CONFIG")]
        config: Option<PathBuf>,
        /// Template output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Do not query AWS for existing shared resources
        #[arg(long)]
        offline: bool,
    },
    /// Check that every enabled id resolves to a forge and parses
    Validate {
        /// Configuration file (searched for when omitted)
        #[arg(short, long, env = "STACKFORGE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// List the available forge types
    Forges,
    /// Show version information
    Version,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Synth {
            config,
            output,
            offline,
        } => commands::synth::handle(config, output, offline).await,
        Commands::Validate { config } => commands::validate::handle(config),
        Commands::Forges => {
            commands::forges::handle();
            Ok(())
        }
        Commands::Version => {
            println!("stackforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
