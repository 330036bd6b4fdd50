mod commands;

use clap::{Parser, Subcommand};
use anyhow::Result;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "crucible-cli")]
#[command(about = "Crucible CLI - Submit solutions, inspect results and list languages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a submission read from a JSON file
    Submit {
        /// Submission file ({ code, language, problemId, testCases })
        #[arg(short, long)]
        file: PathBuf,

        /// Poll until the job has a result and print it
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show state, progress and result of a job
    Status {
        /// Job id printed by `submit`
        id: Uuid,
    },

    /// List configured languages and their commands
    Languages {
        /// Path to languages.json (built-in table if missing)
        #[arg(short, long, default_value = "config/languages.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { file, wait, timeout } => {
            commands::submit(&file, wait, timeout).await?;
        }
        Commands::Status { id } => {
            commands::status(id).await?;
        }
        Commands::Languages { config } => {
            commands::list_languages(&config)?;
        }
    }

    Ok(())
}
