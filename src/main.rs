//! paddock CLI — supervisor daemon and control client

use clap::{Parser, Subcommand};

use paddock::cli;

#[derive(Parser)]
#[command(name = "paddock")]
#[command(about = "Local supervisor for a GGUF inference server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon in the foreground
    Daemon,

    /// Load a model or preset (p:<name>, h:<repo>:<quant>, f:<path>)
    Load {
        /// Identifier of the thing to load
        identifier: String,
    },

    /// Unload the running model
    Unload,

    /// Show supervisor status
    Status,

    /// List stored presets
    Presets,

    /// List downloaded models
    Models,

    /// Download a model without loading it
    Pull {
        /// h:<repo>:<quant> identifier to download
        identifier: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let code = match args.command {
        Commands::Daemon => match cli::run_daemon().await {
            Ok(()) => cli::EXIT_OK,
            Err(e) => {
                eprintln!("error: {e:#}");
                cli::EXIT_GENERIC
            }
        },
        Commands::Load { identifier } => cli::load(&identifier).await,
        Commands::Unload => cli::unload().await,
        Commands::Status => cli::status().await,
        Commands::Presets => cli::list_presets().await,
        Commands::Models => cli::list_models().await,
        Commands::Pull { identifier } => cli::pull(&identifier).await,
    };
    std::process::exit(code);
}
