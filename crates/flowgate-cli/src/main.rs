//! Flowgate CLI — run YAML-defined agent workflows with quality gates and
//! failure recovery, and manage the runs they leave behind.

use clap::{Parser, Subcommand};
use flowgate_cli::commands::{self, runs, workflow};

/// Flowgate — multi-step agent workflows with quality gates
#[derive(Parser)]
#[command(name = "flowgate", version, about = "Flowgate — multi-step agent workflows with quality gates")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "FLOWGATE_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file against a task
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Task description handed to the first step
        #[arg(long, short = 't')]
        task: String,
        /// Print the final run as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a workflow YAML file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },

    /// Show a run, its feedback history and the latest result of each step
    Status {
        run_id: String,
        #[arg(long)]
        json: bool,
    },

    /// List runs, newest first
    List {
        /// Include archived runs
        #[arg(long)]
        all: bool,
        /// Only runs of this workflow id
        #[arg(long)]
        definition: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Continue an interrupted, stopped or failed run from its cursor
    Resume {
        run_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Ask a running run to stop at its next step boundary
    Stop { run_id: String },

    /// Hide a run from the default listing
    Archive { run_id: String },

    /// Bring an archived run back into the default listing
    Unarchive { run_id: String },

    /// Permanently delete a run and its step results
    Delete { run_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowgate_core=warn,flowgate_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let db_path = cli
        .db
        .unwrap_or_else(flowgate_core::Database::default_path);

    let result = match cli.command {
        Commands::Validate { file } => workflow::validate(&file),
        command => dispatch(command, &db_path).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands, db_path: &str) -> Result<(), String> {
    let needs_agent = matches!(command, Commands::Run { .. } | Commands::Resume { .. });
    if needs_agent {
        workflow::load_dotenv();
    }
    let service = commands::init_service(db_path, needs_agent)?;

    match command {
        Commands::Run { file, task, json } => workflow::run(&service, &file, &task, json).await,
        Commands::Validate { file } => workflow::validate(&file),
        Commands::Status { run_id, json } => runs::status(&service, &run_id, json).await,
        Commands::List {
            all,
            definition,
            json,
        } => runs::list(&service, all, definition, json).await,
        Commands::Resume { run_id, json } => runs::resume(&service, &run_id, json).await,
        Commands::Stop { run_id } => runs::stop(&service, &run_id).await,
        Commands::Archive { run_id } => runs::archive(&service, &run_id).await,
        Commands::Unarchive { run_id } => runs::unarchive(&service, &run_id).await,
        Commands::Delete { run_id } => runs::delete(&service, &run_id).await,
    }
}
