use anyhow::Result;
use clap::Args;
use clap_complete::{Shell, generate};

/// Arguments for `haul completions`.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate the completion script for.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Write a completion script for `haul` to stdout.
///
/// # Errors
///
/// Currently infallible; returns `Result` to match the other handlers.
pub fn run_completions(shell: Shell, command: &mut clap::Command) -> Result<()> {
    let mut out = std::io::stdout();
    generate(shell, command, "haul", &mut out);
    Ok(())
}
