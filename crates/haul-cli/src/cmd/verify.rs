use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use haul_core::VerifyReport;

use crate::output::{OutputMode, pretty_kv, render_mode};

/// Arguments for `haul verify`.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Override the target URI (`mongodb://...`, `sqlite://<dir>` or `memory://`).
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,
}

/// Compare the source snapshot with the target without writing anything.
///
/// Missing documents are reported but do not make the command fail.
///
/// # Errors
///
/// Returns an error if configuration, source loading, or the target
/// connection fails.
pub fn run_verify(args: &VerifyArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let mut config = haul_core::resolve_config(project_root)?;
    if let Some(target) = &args.target {
        config.target_uri.clone_from(target);
    }

    let report = haul_core::verify_only(&config).context("verify")?;
    render_mode(output, &report, render_lines, render_pretty)
}

fn render_lines(report: &VerifyReport, w: &mut dyn Write) -> io::Result<()> {
    for c in &report.count_check.collections {
        let mark = if c.status.passed() { "OK  " } else { "FAIL" };
        writeln!(
            w,
            "{mark} count {} ({}/{} {})",
            c.collection,
            c.target,
            c.source,
            c.status.as_str()
        )?;
    }
    for e in &report.existence_check.collections {
        if e.verified {
            writeln!(w, "OK   exists {} ({}/{})", e.collection, e.found, e.total)?;
        } else {
            writeln!(
                w,
                "FAIL exists {} ({}/{}; missing {})",
                e.collection,
                e.found,
                e.total,
                e.missing_sample.join(", ")
            )?;
        }
    }
    writeln!(w, "verify: {}", report.status.as_str())
}

fn render_pretty(report: &VerifyReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_kv(w, "source", report.source.path.display().to_string())?;
    pretty_kv(w, "target", &report.target.uri)?;
    writeln!(w)?;
    render_lines(report, w)
}
