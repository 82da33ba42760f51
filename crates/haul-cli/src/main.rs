#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, DefaultMode, OutputMode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "haul: reconcile a JSON fleet snapshot into a document store",
    long_about = None
)]
struct Cli {
    /// Project directory holding `haul.toml` and the relative data paths.
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Output format. `migrate` defaults to json; `verify` to pretty on a TTY.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Resolve the output mode for the parsed subcommand.
    fn output_mode(&self) -> OutputMode {
        let default = match self.command {
            Commands::Migrate(_) => DefaultMode::Json,
            Commands::Verify(_) | Commands::Completions(_) => DefaultMode::Terminal,
        };
        output::resolve_output_mode(self.format, default)
    }

    fn project_root(&self) -> anyhow::Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => Ok(env::current_dir()?),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Back up, reconcile, and verify the snapshot",
        long_about = "Back up the source snapshot, provision indexes, upsert every \
                      collection into the target, record run metadata, and verify \
                      counts and per-record existence. Safe to re-run.",
        after_help = "EXAMPLES:\n    # Migrate using haul.toml in the current directory\n    haul migrate\n\n    # Migrate into a MongoDB replica set\n    haul migrate --target mongodb://db1:27017,db2:27017/?replicaSet=rs0\n\n    # Migrate into a local SQLite directory instead\n    haul migrate --target sqlite://out\n\n    # Human-readable summary\n    haul migrate --format pretty"
    )]
    Migrate(cmd::migrate::MigrateArgs),

    #[command(
        about = "Verify the target against the snapshot without writing",
        after_help = "EXAMPLES:\n    # Check the configured target\n    haul verify\n\n    # Machine-readable report\n    haul verify --format json"
    )]
    Verify(cmd::verify::VerifyArgs),

    #[command(
        about = "Generate shell completions",
        after_help = "EXAMPLES:\n    # Bash\n    haul completions bash > /etc/bash_completion.d/haul"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HAUL_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "haul=debug,info"
        } else {
            "haul=info,warn"
        })
    });

    let format = env::var("HAUL_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries the report; diagnostics go to stderr.
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn dispatch(cli: &Cli, output: OutputMode) -> anyhow::Result<()> {
    let project_root = cli.project_root()?;
    match &cli.command {
        Commands::Migrate(args) => cmd::migrate::run_migrate(args, output, &project_root),
        Commands::Verify(args) => cmd::verify::run_verify(args, output, &project_root),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let output = cli.output_mode();

    match dispatch(&cli, output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            if output::render_error(output, &CliError::from_anyhow(&err)).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
