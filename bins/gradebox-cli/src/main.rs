mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gradebox-cli")]
#[command(about = "Gradebox CLI - Re-run grading and inspect submissions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-run the autograder for selected submissions
    Rerun {
        /// Only re-run this submission
        #[arg(short, long)]
        submission: Option<String>,

        /// Only re-run submissions for this assignment slug
        #[arg(short, long)]
        assignment: Option<String>,

        /// Only re-run submissions of this user
        #[arg(short, long)]
        user: Option<String>,

        /// Seconds to wait for each job to finish
        #[arg(long, default_value = "60")]
        wait_secs: u64,
    },

    /// Poll a submission once and print the status response
    Status {
        /// Submission id
        #[arg(short, long)]
        submission: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Rerun {
            submission,
            assignment,
            user,
            wait_secs,
        } => {
            let filter = commands::RerunFilter {
                submission,
                assignment,
                user,
            };
            commands::rerun(&filter, Duration::from_secs(wait_secs)).await?;
        }
        Commands::Status { submission } => {
            commands::status(&submission).await?;
        }
    }

    Ok(())
}
