//! Benchmark records of adapter fine-tuning runs.
//!
//! # Modules
//!
//! - [`record`] - The `RunRecord` data model (`run_info` / `train_info` / `meta_info`)
//! - [`io`] - Reading and writing records
//! - [`summary`] - Per-run summaries, ranking and Pareto fronts
//! - [`markdown`] - Markdown report generation

pub mod io;
pub mod markdown;
pub mod record;
pub mod summary;

pub use io::{read_record, read_records_dir, write_record, RecordSet};
pub use record::{MetaInfo, RunInfo, RunRecord, StepMetrics, TrainInfo, TrainStatus};
pub use summary::{pareto_front, sort_by_metric, summarize, Direction, Metric, RunSummary};
