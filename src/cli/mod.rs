pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::audit::task::AuditType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug output from the client
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file; the platform data dir is used when no path is given
    #[arg(long, global = true, num_args = 0..=1, value_name = "PATH")]
    pub log_file: Option<Option<PathBuf>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit an audit and follow it until results are available
    Audit {
        /// Site to audit; `https://` is assumed when no scheme is given
        #[arg(required = true)]
        url: String,

        /// Audit depth
        #[arg(short = 't', long = "type", value_enum)]
        audit_type: Option<AuditType>,

        /// Maximum number of pages to scan
        #[arg(short, long)]
        max_pages: Option<u32>,

        /// Fresh submissions to attempt after a timeout or backend failure
        #[arg(short, long, default_value_t = 0)]
        retries: u32,
    },

    /// Show the current status of a task once
    Status {
        /// Task ID returned at submission
        #[arg(required = true)]
        task_id: String,
    },

    /// Follow an already submitted task
    Watch {
        #[arg(required = true)]
        task_id: String,

        /// URL the task was submitted for
        #[arg(short, long)]
        url: String,
    },

    /// Stop following a task and ask the backend to cancel it
    Cancel {
        #[arg(required = true)]
        task_id: String,
    },

    /// Fetch the results of a completed task
    Results {
        #[arg(required = true)]
        task_id: String,

        /// Write the results as JSON to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show or create the configuration file
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Audit { url, audit_type, max_pages, retries } => {
            info!("Starting audit of {}", url);
            commands::audit(url, audit_type, max_pages, retries).await
        },
        Commands::Status { task_id } => {
            info!("Checking status for task {}", task_id);
            commands::status(task_id).await
        },
        Commands::Watch { task_id, url } => {
            info!("Watching task {}", task_id);
            commands::watch(task_id, url).await
        },
        Commands::Cancel { task_id } => {
            info!("Cancelling task {}", task_id);
            commands::cancel(task_id).await
        },
        Commands::Results { task_id, output } => {
            info!("Fetching results for task {}", task_id);
            commands::results(task_id, output).await
        },
        Commands::Config { show } => {
            if show {
                commands::show_config().await
            } else {
                commands::init_config().await
            }
        },
    }
}
