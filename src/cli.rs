//! Command line interface.
//!
//! `peftkit` summarizes directories of benchmark records, computes Pareto
//! fronts, inspects saved adapters and validates record files.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use crate::bench::markdown::{comparison_table, detailed_report};
use crate::bench::summary::{pareto_front, sort_by_metric, summarize, Metric};
use crate::bench::{read_record, read_records_dir};
use crate::io::inspect_adapter_dir;
use crate::training::format_parameter_count;

/// peftkit command line.
#[derive(Parser, Debug)]
#[command(name = "peftkit")]
#[command(author, version, about = "PEFT adapter and benchmark record tooling", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter for the chosen verbosity.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a markdown comparison table of all records in a directory.
    Summary {
        /// Directory of benchmark JSON files
        dir: PathBuf,

        /// Metric to rank by
        #[arg(short, long, default_value = "test_accuracy")]
        sort: Metric,

        /// Write the report to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Append a detailed section per run
        #[arg(short, long)]
        detailed: bool,
    },

    /// List the runs on the Pareto front of two metrics.
    Pareto {
        /// Directory of benchmark JSON files
        dir: PathBuf,

        /// First metric
        #[arg(long, default_value = "memory_max")]
        x: Metric,

        /// Second metric
        #[arg(long, default_value = "test_accuracy")]
        y: Metric,
    },

    /// Describe a saved adapter directory.
    Inspect {
        /// Directory holding adapter_config.json and adapter_model.safetensors
        adapter_dir: PathBuf,
    },

    /// Check that record files parse. Fails if any file is invalid.
    Validate {
        /// Record files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Run a parsed command line.
///
/// # Errors
///
/// Returns an error if a command fails or, for `validate`, if any file is
/// not a valid record.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Summary {
            dir,
            sort,
            output,
            detailed,
        } => {
            let set = read_records_dir(&dir)
                .with_context(|| format!("reading records from {}", dir.display()))?;
            if set.is_empty() {
                bail!("no benchmark records found in {}", dir.display());
            }
            let mut summaries = summarize(set.iter());
            sort_by_metric(&mut summaries, sort);

            let mut report = comparison_table(&summaries);
            if detailed {
                report.push('\n');
                report.push_str(&detailed_report(set.iter()));
            }
            match output {
                Some(path) => {
                    fs::write(&path, report)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), runs = summaries.len(), "wrote summary");
                }
                None => print!("{report}"),
            }
            if !set.skipped.is_empty() {
                eprintln!("skipped {} unreadable file(s)", set.skipped.len());
            }
            Ok(())
        }
        Commands::Pareto { dir, x, y } => {
            let set = read_records_dir(&dir)
                .with_context(|| format!("reading records from {}", dir.display()))?;
            let summaries = summarize(set.iter());
            let front = pareto_front(&summaries, x, y);
            println!("Pareto front of {x} vs {y} ({} of {} runs):", front.len(), summaries.len());
            for run in front {
                let fmt = |m: Metric| m.value(run).map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
                println!("  {:<40} {x}={} {y}={}", run.name, fmt(x), fmt(y));
            }
            Ok(())
        }
        Commands::Inspect { adapter_dir } => {
            let info = inspect_adapter_dir(&adapter_dir)
                .with_context(|| format!("inspecting {}", adapter_dir.display()))?;
            let base = info.config.base();
            println!("Type:       {}", info.config.peft_type());
            println!("Targets:    {}", base.target_modules.join(", "));
            if !base.exclude_modules.is_empty() {
                println!("Excludes:   {}", base.exclude_modules.join(", "));
            }
            println!("Modules:    {}", info.modules().len());
            println!(
                "Parameters: {} ({})",
                info.num_parameters(),
                format_parameter_count(info.num_parameters())
            );
            println!("Tensors:");
            for tensor in &info.tensors {
                println!("  {:<60} {:>5} {:?}", tensor.name, tensor.dtype, tensor.shape);
            }
            Ok(())
        }
        Commands::Validate { files } => {
            let mut failures = 0usize;
            for path in &files {
                match read_record(path) {
                    Ok(record) => {
                        println!("ok      {} ({}, {})", path.display(), record.name(), record.train_info.status);
                    }
                    Err(err) => {
                        failures += 1;
                        println!("invalid {}: {err}", path.display());
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} file(s) are not valid records", files.len());
            }
            Ok(())
        }
    }
}
