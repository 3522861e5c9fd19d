//! Markdown output generation for benchmark records.
//!
//! This module renders a comparison table over many runs and a detailed
//! report for single runs.

use std::fmt::{self, Write};

use crate::bench::record::RunRecord;
use crate::bench::summary::RunSummary;
use crate::training::format_parameter_count;

fn opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.precision$}"))
}

#[allow(clippy::cast_precision_loss)]
fn gib(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1u64 << 30) as f64)
}

/// Write a comparison table of `summaries`, in the given order.
///
/// # Errors
/// Returns an error if the writer fails.
pub fn write_comparison_table<W: Write>(out: &mut W, summaries: &[RunSummary]) -> fmt::Result {
    writeln!(out, "# Benchmark Summary")?;
    writeln!(out)?;
    writeln!(out, "Generated: {}", chrono::Utc::now().to_rfc3339())?;
    writeln!(out)?;
    writeln!(
        out,
        "| Experiment | Type | Status | Test acc | Best valid acc | Train loss | Mem max (GiB) | Train time (s) | Params | File (MB) |"
    )?;
    writeln!(
        out,
        "|------------|------|--------|----------|----------------|------------|---------------|----------------|--------|-----------|"
    )?;

    for s in summaries {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let params = format_parameter_count(s.num_trainable_params as usize);
        #[allow(clippy::cast_precision_loss)]
        let file_mb = s.file_size as f64 / 1e6;
        writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} | {:.0} | {} | {:.1} |",
            s.name,
            s.peft_type.as_deref().unwrap_or("-"),
            s.status,
            opt(s.test_accuracy, 4),
            opt(s.best_valid_accuracy, 4),
            opt(s.final_train_loss, 4),
            gib(s.accelerator_memory_max),
            s.train_time,
            params,
            file_mb,
        )?;
    }

    writeln!(out)?;
    writeln!(out, "---")?;
    writeln!(out, "Total runs: {}", summaries.len())?;

    let failed: Vec<&RunSummary> = summaries.iter().filter(|s| !s.is_success()).collect();
    if !failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "## Failed runs")?;
        writeln!(out)?;
        for s in failed {
            writeln!(out, "- **{}** ({}): {}", s.name, s.status, s.error_msg)?;
        }
    }
    Ok(())
}

/// Comparison table as a string.
#[must_use]
pub fn comparison_table(summaries: &[RunSummary]) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_comparison_table(&mut out, summaries);
    out
}

/// Write a detailed report of one run.
///
/// # Errors
/// Returns an error if the writer fails.
pub fn write_run_report<W: Write>(out: &mut W, record: &RunRecord) -> fmt::Result {
    let run = &record.run_info;
    let train = &record.train_info;

    writeln!(out, "## {}", run.experiment_name)?;
    writeln!(out)?;
    if let Some(created_at) = run.created_at {
        writeln!(out, "**Created:** {}", created_at.to_rfc3339())?;
    }
    writeln!(out, "**Status:** {}", train.status)?;
    if !run.error_msg.is_empty() {
        writeln!(out, "**Error:** {}", run.error_msg)?;
    }
    writeln!(out, "**Model:** {}", run.train_config.model_id)?;
    writeln!(
        out,
        "**Steps:** {} (batch size {}, lr {})",
        run.train_config.max_steps, run.train_config.batch_size, run.train_config.optimizer_kwargs.lr
    )?;
    writeln!(
        out,
        "**Parameters:** {} trainable of {}",
        train.num_trainable_params, train.num_total_params
    )?;
    writeln!(out)?;

    if let Some(peft_config) = &run.peft_config {
        writeln!(out, "**Adapter config:**")?;
        writeln!(out, "```json")?;
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(peft_config).unwrap_or_default()
        )?;
        writeln!(out, "```")?;
        writeln!(out)?;
    }

    if !train.metrics.is_empty() {
        let mut keys: Vec<&str> = train
            .metrics
            .iter()
            .flat_map(|m| m.values.keys().map(String::as_str))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        write!(out, "| step |")?;
        for key in &keys {
            write!(out, " {key} |")?;
        }
        writeln!(out)?;
        write!(out, "|------|")?;
        for _ in &keys {
            write!(out, "---|")?;
        }
        writeln!(out)?;
        for entry in &train.metrics {
            write!(out, "| {} |", entry.step)?;
            for key in &keys {
                write!(out, " {} |", opt(entry.get(key), 4))?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Detailed report of several runs as a string.
#[must_use]
pub fn detailed_report<'a>(records: impl IntoIterator<Item = &'a RunRecord>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Detailed Benchmark Report");
    let _ = writeln!(out);
    for record in records {
        let _ = write_run_report(&mut out, record);
    }
    out
}
