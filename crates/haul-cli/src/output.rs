//! Output layer shared by every `haul` command.
//!
//! # Output mode resolution
//!
//! Precedence (highest wins):
//! 1. `--format`
//! 2. `HAUL_FORMAT` env var: `"pretty"` | `"text"` | `"json"`
//! 3. The command's own default. `migrate` defaults to JSON so the run
//!    summary can be piped; other commands pick pretty on a TTY and text
//!    when piped.

use clap::ValueEnum;
use haul_core::MigrateError;
use serde::Serialize;
use std::io::{self, IsTerminal, Write};

/// Shared width for human pretty separators.
pub const PRETTY_RULE_WIDTH: usize = 72;

/// Write a horizontal separator used by pretty human output.
pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = PRETTY_RULE_WIDTH)
}

/// Write a section heading followed by a separator.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

/// The three output modes supported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Human-optimized output with sections.
    Pretty,
    /// Plain `key=value` lines for scripts and pipes.
    Text,
    /// The full report as pretty-printed JSON.
    Json,
}

/// What a command falls back to when neither flag nor env picks a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultMode {
    Json,
    Terminal,
}

fn resolve_output_mode_inner(
    format_flag: Option<OutputMode>,
    format_env: Option<&str>,
    default: DefaultMode,
    is_tty: bool,
) -> OutputMode {
    if let Some(mode) = format_flag {
        return mode;
    }

    if let Some(val) = format_env {
        match val.to_lowercase().as_str() {
            "json" => return OutputMode::Json,
            "text" => return OutputMode::Text,
            "pretty" => return OutputMode::Pretty,
            _ => {}
        }
    }

    match default {
        DefaultMode::Json => OutputMode::Json,
        DefaultMode::Terminal if is_tty => OutputMode::Pretty,
        DefaultMode::Terminal => OutputMode::Text,
    }
}

/// Resolve the output mode from the flag, `HAUL_FORMAT`, and the command default.
pub fn resolve_output_mode(format_flag: Option<OutputMode>, default: DefaultMode) -> OutputMode {
    let env_val = std::env::var("HAUL_FORMAT").ok();
    let is_tty = io::stdout().is_terminal();
    resolve_output_mode_inner(format_flag, env_val.as_deref(), default, is_tty)
}

/// Render a serializable value with explicit pretty/text renderers.
pub fn render_mode<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Text => text_fn(value, &mut out)?,
        OutputMode::Pretty => pretty_fn(value, &mut out)?,
    }
    Ok(())
}

/// A structured error with optional suggestion and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    /// Human-readable error message.
    pub message: String,
    /// Optional suggestion for how to fix the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Machine-readable error code (`E####`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    /// Create a simple error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            error_code: None,
        }
    }

    /// Build from any `anyhow` error, keeping the code and hint when a
    /// [`MigrateError`] sits anywhere in the chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        match err.downcast_ref::<MigrateError>() {
            Some(fatal) => Self {
                message,
                ..Self::from(fatal)
            },
            None => Self::new(message),
        }
    }
}

impl From<&MigrateError> for CliError {
    fn from(err: &MigrateError) -> Self {
        Self {
            message: err.to_string(),
            suggestion: err.hint().map(str::to_string),
            error_code: Some(err.code().to_string()),
        }
    }
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(mode, error, &mut out)?;
    Ok(())
}

fn write_error(mode: OutputMode, error: &CliError, out: &mut dyn Write) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({
                "error": error,
            });
            serde_json::to_writer_pretty(&mut *out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            match &error.error_code {
                Some(code) => writeln!(out, "error[{code}]: {}", error.message)?,
                None => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(ref suggestion) = error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // ── resolve_output_mode_inner ──────────────────────────────────────────

    #[test]
    fn format_flag_wins_over_env_and_default() {
        let mode = resolve_output_mode_inner(
            Some(OutputMode::Text),
            Some("pretty"),
            DefaultMode::Json,
            true,
        );
        assert_eq!(mode, OutputMode::Text);
    }

    #[test]
    fn env_wins_over_command_default() {
        let mode = resolve_output_mode_inner(None, Some("PRETTY"), DefaultMode::Json, false);
        assert_eq!(mode, OutputMode::Pretty);
    }

    #[test]
    fn unknown_env_value_falls_through() {
        let mode = resolve_output_mode_inner(None, Some("yaml"), DefaultMode::Terminal, false);
        assert_eq!(mode, OutputMode::Text);
    }

    #[test]
    fn json_default_ignores_tty() {
        assert_eq!(
            resolve_output_mode_inner(None, None, DefaultMode::Json, true),
            OutputMode::Json
        );
    }

    #[test]
    fn terminal_default_follows_tty() {
        assert_eq!(
            resolve_output_mode_inner(None, None, DefaultMode::Terminal, true),
            OutputMode::Pretty
        );
        assert_eq!(
            resolve_output_mode_inner(None, None, DefaultMode::Terminal, false),
            OutputMode::Text
        );
    }

    // ── errors ─────────────────────────────────────────────────────────────

    #[test]
    fn migrate_error_carries_code_and_hint() {
        let err = MigrateError::SourceParse {
            path: PathBuf::from("data/db.json"),
            reason: "expected value at line 1 column 1".into(),
        };
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E1002"));
        assert!(cli.suggestion.is_some());
        assert!(cli.message.contains("data/db.json"));
    }

    #[test]
    fn code_survives_anyhow_context() {
        let err = anyhow::Error::new(MigrateError::InvalidConfig("batch_size must be >= 1".into()))
            .context("migrate");
        let cli = CliError::from_anyhow(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E1003"));
        assert!(cli.message.starts_with("migrate: "));
    }

    #[test]
    fn plain_anyhow_error_has_no_code() {
        let cli = CliError::from_anyhow(&anyhow::anyhow!("boom"));
        assert_eq!(cli.message, "boom");
        assert!(cli.error_code.is_none());
    }

    #[test]
    fn text_error_shows_code_and_suggestion() {
        let err = CliError {
            message: "cannot connect".into(),
            suggestion: Some("retry".into()),
            error_code: Some("E2001".into()),
        };
        let mut buf = Vec::new();
        write_error(OutputMode::Text, &err, &mut buf).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(text, "error[E2001]: cannot connect\n  suggestion: retry\n");
    }

    #[test]
    fn json_error_is_wrapped() {
        let err = CliError::new("boom");
        let mut buf = Vec::new();
        write_error(OutputMode::Json, &err, &mut buf).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["error"]["message"], "boom");
        assert!(value["error"].get("error_code").is_none());
    }

    #[test]
    fn pretty_kv_pads_keys() {
        let mut buf = Vec::new();
        pretty_kv(&mut buf, "status", "success").expect("write");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "status:      success\n");
    }
}
