//! Reading, summarizing and reporting the recorded benchmark runs under
//! `tests/fixtures/records`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use peftkit::bench::io::record_file_name;
use peftkit::bench::markdown::{comparison_table, detailed_report};
use peftkit::bench::{
    pareto_front, read_record, read_records_dir, sort_by_metric, summarize, write_record, Metric,
    RunRecord, TrainStatus,
};
use peftkit::TrainConfig;
use tempfile::TempDir;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/records")
}

#[test]
fn test_read_fixture_directory() -> Result<()> {
    let set = read_records_dir(fixtures())?;
    assert_eq!(set.len(), 3);
    assert!(set.skipped.is_empty());

    let names: Vec<&str> = set.iter().map(RunRecord::name).collect();
    assert_eq!(
        names,
        vec![
            "boft/llama-3.2-3B-default",
            "lora/llama-3.2-3B-rank32",
            "oft/llama-3.2-3B-b32"
        ]
    );
    Ok(())
}

#[test]
fn test_lora_fixture_fields() -> Result<()> {
    let record = read_record(fixtures().join("lora--llama-3.2-3B-rank32.json"))?;
    let config = &record.run_info.train_config;
    assert_eq!(config.model_id, "meta-llama/Llama-3.2-3B");
    assert_eq!(config.optimizer_kwargs.lr, 1e-4);
    assert_eq!(config.lr_scheduler.as_deref(), Some("cosine"));
    assert!(config.attn_implementation.is_none());
    assert_eq!(record.peft_type(), Some("LORA"));

    let train = &record.train_info;
    assert_eq!(train.status, TrainStatus::Success);
    assert_eq!(train.accelerator_memory_max, 22_163_750_912);
    assert_eq!(train.max_metric("valid accuracy"), Some(0.42));
    assert_eq!(
        record.meta_info.system_info.accelerator,
        "NVIDIA GeForce RTX 4090"
    );
    Ok(())
}

#[test]
fn test_failed_fixture_keeps_error() -> Result<()> {
    let record = read_record(fixtures().join("boft--llama-3.2-3B-default.json"))?;
    assert!(!record.is_success());
    assert_eq!(record.train_info.status, TrainStatus::Failed);
    assert_eq!(record.run_info.error_msg, "CUDA out of memory");
    // Missing train_config keys fall back to their defaults.
    let expected = TrainConfig {
        model_id: "meta-llama/Llama-3.2-3B".to_string(),
        ..TrainConfig::default()
    };
    assert_eq!(record.run_info.train_config, expected);
    Ok(())
}

#[test]
fn test_ranking_and_pareto_front() -> Result<()> {
    let set = read_records_dir(fixtures())?;
    let mut summaries = summarize(set.iter());
    sort_by_metric(&mut summaries, Metric::TestAccuracy);
    let order: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
    // The failed run has no test accuracy and goes last.
    assert_eq!(
        order,
        vec![
            "lora/llama-3.2-3B-rank32",
            "oft/llama-3.2-3B-b32",
            "boft/llama-3.2-3B-default"
        ]
    );

    // OFT uses less memory, LoRA reaches a higher accuracy: both are optimal.
    let front = pareto_front(&summaries, Metric::MemoryMax, Metric::TestAccuracy);
    let names: Vec<&str> = front.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["oft/llama-3.2-3B-b32", "lora/llama-3.2-3B-rank32"]);

    // LoRA is both faster and more accurate than OFT.
    let front = pareto_front(&summaries, Metric::TrainTime, Metric::TestAccuracy);
    assert_eq!(front.len(), 1);
    assert_eq!(front[0].name, "lora/llama-3.2-3B-rank32");
    Ok(())
}

#[test]
fn test_markdown_reports() -> Result<()> {
    let set = read_records_dir(fixtures())?;
    let summaries = summarize(set.iter());
    let table = comparison_table(&summaries);
    assert!(table.contains("| lora/llama-3.2-3B-rank32 | LORA | success | 0.4800 | 0.4200 |"));
    assert!(table.contains("Total runs: 3"));
    assert!(table.contains("- **boft/llama-3.2-3B-default** (failed): CUDA out of memory"));

    let report = detailed_report(set.iter());
    assert!(report.contains("## oft/llama-3.2-3B-b32"));
    assert!(report.contains("**Error:** CUDA out of memory"));
    assert!(report.contains("\"peft_type\": \"OFT\""));
    Ok(())
}

#[test]
fn test_write_then_read_preserves_unknown_keys() -> Result<()> {
    let record = read_record(fixtures().join("lora--llama-3.2-3B-rank32.json"))?;
    let temp = TempDir::new()?;
    let path = temp.path().join(record_file_name(&record));
    assert!(path.ends_with("lora--llama-3.2-3B-rank32.json"));

    write_record(&record, &path)?;
    let reread = read_record(&path)?;
    assert_eq!(reread, record);
    assert_eq!(
        reread.meta_info.package_info.get("transformers-version"),
        Some(&Some("4.50.0".to_string()))
    );
    Ok(())
}

#[test]
fn test_directory_with_broken_file_is_partially_read() -> Result<()> {
    let temp = TempDir::new()?;
    std::fs::copy(
        fixtures().join("oft--llama-3.2-3B-b32.json"),
        temp.path().join("oft.json"),
    )?;
    std::fs::write(temp.path().join("broken.json"), "{\"run_info\": ")?;
    std::fs::write(temp.path().join("notes.txt"), "not a record")?;

    let set = read_records_dir(temp.path())?;
    assert_eq!(set.len(), 1);
    assert_eq!(set.skipped.len(), 1);
    Ok(())
}
