#![forbid(unsafe_code)]
//! `cache_check`: validate cache metadata on a device or file.

use anyhow::{Context, Result};
use clap::Parser;
use cmt_cache::{
    check_device, CheckOptions, CheckReport, Damage, DamageVisitor, PathClassification,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cache_check",
    version,
    about = "Validates cache metadata on a device or file"
)]
struct Cli {
    /// Path to the cache metadata device or file.
    device: PathBuf,

    /// Suppress output messages; the exit code still reports the verdict.
    #[arg(short, long)]
    quiet: bool,

    /// Only check the superblock.
    #[arg(long)]
    super_block_only: bool,

    /// Don't check the mapping array.
    #[arg(long)]
    skip_mappings: bool,

    /// Don't check the hint array.
    #[arg(long)]
    skip_hints: bool,

    /// Don't check the discard bitset.
    #[arg(long)]
    skip_discards: bool,

    /// Clear the needs-check flag if the check succeeds.
    #[arg(long = "clear-needs-check-flag")]
    clear_needs_check: bool,

    /// Emit the findings as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn options_from(cli: &Cli) -> CheckOptions {
    CheckOptions {
        check_mappings: !(cli.skip_mappings || cli.super_block_only),
        check_hints: !(cli.skip_hints || cli.super_block_only),
        check_discards: !(cli.skip_discards || cli.super_block_only),
        skip_nonfatal: false,
        quiet: cli.quiet,
        clear_needs_check_on_success: cli.clear_needs_check,
    }
}

/// Prints damage as it arrives and keeps it for the JSON summary.
struct Reporter {
    quiet: bool,
    json: bool,
    findings: Vec<Damage>,
}

impl Reporter {
    fn new(quiet: bool, json: bool) -> Self {
        Self {
            quiet,
            json,
            findings: Vec::new(),
        }
    }
}

impl DamageVisitor for Reporter {
    fn visit(&mut self, damage: Damage) {
        if !self.quiet && !self.json {
            eprintln!("{damage}");
        }
        self.findings.push(damage);
    }
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    report: &'a CheckReport,
    damage: &'a [Damage],
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(error) => {
            if !cli.quiet {
                eprintln!("error: {error:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<bool> {
    let opts = options_from(cli);
    let mut reporter = Reporter::new(cli.quiet, cli.json);
    let report = check_device(&cli.device, &opts, &mut reporter)
        .with_context(|| format!("failed to check {}", cli.device.display()))?;

    if !cli.quiet {
        match report.classification {
            PathClassification::LooksLikeXml => eprintln!(
                "This looks like XML. cache_check only checks the binary metadata format."
            ),
            PathClassification::TooSmall => {
                eprintln!("Metadata device or file is too small. Is this binary cache metadata?");
            }
            PathClassification::Metadata => {}
        }
    }

    if cli.json {
        let output = JsonOutput {
            report: &report,
            damage: &reporter.findings,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize findings")?
        );
    }

    Ok(report.success(opts.skip_nonfatal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn super_block_only_disables_every_walk() {
        let cli = Cli::parse_from(["cache_check", "--super-block-only", "md"]);
        let opts = options_from(&cli);
        assert!(!opts.check_mappings);
        assert!(!opts.check_hints);
        assert!(!opts.check_discards);
    }

    #[test]
    fn skip_flags_map_one_to_one() {
        let cli = Cli::parse_from(["cache_check", "--skip-hints", "--skip-discards", "md"]);
        let opts = options_from(&cli);
        assert!(opts.check_mappings);
        assert!(!opts.check_hints);
        assert!(!opts.check_discards);
    }

    #[test]
    fn clear_flag_and_quiet_are_carried() {
        let cli = Cli::parse_from(["cache_check", "-q", "--clear-needs-check-flag", "md"]);
        let opts = options_from(&cli);
        assert!(opts.quiet);
        assert!(opts.clear_needs_check_on_success);
    }
}
