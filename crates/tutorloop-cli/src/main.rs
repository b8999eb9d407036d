//! tutorloop CLI: the user-facing command-line interface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "tutorloop", version, about = "Adaptive Python tutoring pipeline")]
struct Cli {
    /// Config file path (default: ./tutorloop.toml, then ~/.config/tutorloop/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create starter config and example problem bank
    Init,

    /// Validate problem bank TOML files
    Validate {
        /// Problem bank file or directory (default: `problem_bank` from config)
        #[arg(long)]
        bank: Option<PathBuf>,
    },

    /// Load problem banks into the database
    Seed {
        /// Problem bank file or directory (default: `problem_bank` from config)
        #[arg(long)]
        bank: Option<PathBuf>,
    },

    /// Register a student
    Register {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,
    },

    /// Evaluate one submission
    Submit {
        /// Student id or email
        #[arg(long)]
        student: String,

        #[arg(long)]
        problem: String,

        /// Python source file, or `-` for stdin
        #[arg(long)]
        code: PathBuf,

        /// Ask for a deep explanation regardless of performance
        #[arg(long)]
        deep: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate every submission listed in a manifest, concurrently
    Batch {
        /// TOML manifest with [[submissions]] tables
        #[arg(long)]
        manifest: PathBuf,

        /// Print results as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show a student's capability profile
    Profile {
        /// Student id or email
        #[arg(long)]
        student: String,

        /// Number of recent submissions to list
        #[arg(long, default_value = "10")]
        recent: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show class-wide statistics
    Dashboard {
        #[arg(long)]
        json: bool,
    },

    /// Inspect and resolve the escalation queue
    Escalations {
        #[command(subcommand)]
        action: EscalationAction,
    },
}

#[derive(Subcommand)]
enum EscalationAction {
    /// List escalations (unresolved only unless --all)
    List {
        #[arg(long)]
        all: bool,
    },

    /// Mark an escalation resolved
    Resolve { id: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tutorloop=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    let result = match cli.command {
        Commands::Init => commands::init::execute(),
        Commands::Validate { bank } => commands::validate::execute(bank, config),
        Commands::Seed { bank } => commands::seed::execute(bank, config),
        Commands::Register { name, email } => commands::register::execute(name, email, config),
        Commands::Submit {
            student,
            problem,
            code,
            deep,
            json,
        } => commands::submit::execute(student, problem, code, deep, json, config).await,
        Commands::Batch { manifest, json } => {
            commands::submit::execute_batch(manifest, json, config).await
        }
        Commands::Profile {
            student,
            recent,
            json,
        } => commands::profile::execute(student, recent, json, config),
        Commands::Dashboard { json } => commands::dashboard::execute(json, config),
        Commands::Escalations { action } => match action {
            EscalationAction::List { all } => commands::escalations::list(all, config),
            EscalationAction::Resolve { id } => commands::escalations::resolve(id, config),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
