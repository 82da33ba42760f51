use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use haul_core::RunReport;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Arguments for `haul migrate`.
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Override the target URI (`mongodb://...`, `sqlite://<dir>` or `memory://`).
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,

    /// Override the records-per-batch setting.
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,
}

/// Run a full migration and print the run report.
///
/// A run that finishes with verification warnings still succeeds; only
/// fatal errors are returned.
///
/// # Errors
///
/// Returns an error if configuration, source loading, or the target
/// connection fails.
pub fn run_migrate(args: &MigrateArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let mut config = haul_core::resolve_config(project_root)?;
    if let Some(target) = &args.target {
        config.target_uri.clone_from(target);
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }

    let report = haul_core::run(&config).context("migrate")?;
    render_mode(output, &report, render_text, render_pretty)
}

fn render_text(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "run={} status={}", report.run_id, report.status.as_str())?;
    for c in &report.collections {
        writeln!(
            w,
            "{} inserted={} updated={} skipped={} conflicts={} fallbacks={}",
            c.collection, c.inserted, c.updated, c.skipped, c.conflicts_retried, c.batch_fallbacks
        )?;
    }
    for c in &report.count_check.collections {
        writeln!(
            w,
            "count {} source={} target={} {}",
            c.collection,
            c.source,
            c.target,
            c.status.as_str()
        )?;
    }
    Ok(())
}

fn render_pretty(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Migration {}", report.run_id))?;
    pretty_kv(w, "source", report.source.path.display().to_string())?;
    pretty_kv(w, "target", &report.target.uri)?;
    pretty_kv(w, "database", &report.target.database)?;
    let backup = match (&report.backup.path, report.backup.verified) {
        (Some(path), true) => path.display().to_string(),
        (Some(path), false) => format!("{} (unverified)", path.display()),
        (None, _) => "none".to_string(),
    };
    pretty_kv(w, "backup", backup)?;
    pretty_kv(w, "duration", format!("{} ms", report.duration_ms))?;
    writeln!(w)?;

    pretty_section(w, "Collections")?;
    for c in &report.collections {
        match &c.skipped_reason {
            Some(reason) => writeln!(w, "{:<22} skipped ({reason})", c.collection)?,
            None => writeln!(
                w,
                "{:<22} +{} ~{} skipped {}",
                c.collection, c.inserted, c.updated, c.skipped
            )?,
        }
    }
    writeln!(w)?;

    pretty_section(w, "Verification")?;
    for c in &report.count_check.collections {
        let mark = if c.status.passed() { "OK  " } else { "FAIL" };
        writeln!(
            w,
            "{mark} {:<22} {}/{} {}",
            c.collection,
            c.target,
            c.source,
            c.status.as_str()
        )?;
    }
    for e in report.existence_check.collections.iter().filter(|e| !e.verified) {
        writeln!(w, "FAIL {:<22} missing: {}", e.collection, e.missing_sample.join(", "))?;
    }
    writeln!(w)?;
    pretty_kv(w, "status", report.status.as_str())?;
    if let Some(log_file) = &report.log_file {
        pretty_kv(w, "log", log_file.display().to_string())?;
    }
    Ok(())
}
