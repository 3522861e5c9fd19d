//! Per-run summaries, ranking and Pareto fronts.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::bench::record::{RunRecord, TrainStatus, TEST_ACCURACY, TRAIN_LOSS, VALID_ACCURACY};
use crate::error::PeftError;

/// Headline numbers of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Experiment name
    pub name: String,
    /// Adapter type tag, if recorded
    pub peft_type: Option<String>,
    /// Outcome
    pub status: TrainStatus,
    /// Final test accuracy
    pub test_accuracy: Option<f64>,
    /// Best validation accuracy
    pub best_valid_accuracy: Option<f64>,
    /// Last logged training loss
    pub final_train_loss: Option<f64>,
    /// Peak accelerator memory in bytes
    pub accelerator_memory_max: u64,
    /// Training wall time in seconds
    pub train_time: f64,
    /// Saved adapter size in bytes
    pub file_size: u64,
    /// Trainable parameter count
    pub num_trainable_params: u64,
    /// Trainable share of all parameters
    pub trainable_fraction: Option<f64>,
    /// Error message of a failed run
    pub error_msg: String,
}

impl RunSummary {
    /// Summarize one record.
    #[must_use]
    pub fn from_record(record: &RunRecord) -> Self {
        let train = &record.train_info;
        Self {
            name: record.name().to_string(),
            peft_type: record.peft_type().map(str::to_string),
            status: train.status,
            test_accuracy: train.last_metric(TEST_ACCURACY),
            best_valid_accuracy: train.max_metric(VALID_ACCURACY),
            final_train_loss: train.last_metric(TRAIN_LOSS),
            accelerator_memory_max: train.accelerator_memory_max,
            train_time: train.train_time,
            file_size: train.file_size,
            num_trainable_params: train.num_trainable_params,
            trainable_fraction: train.trainable_fraction(),
            error_msg: record.run_info.error_msg.clone(),
        }
    }

    /// True for runs that finished without error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TrainStatus::Success && self.error_msg.is_empty()
    }
}

/// Summaries of all records, in input order.
pub fn summarize<'a>(records: impl IntoIterator<Item = &'a RunRecord>) -> Vec<RunSummary> {
    records.into_iter().map(RunSummary::from_record).collect()
}

/// Whether larger or smaller values are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Larger is better
    Maximize,
    /// Smaller is better
    Minimize,
}

impl Direction {
    /// `Less` when `a` is better than `b`.
    fn compare(self, a: f64, b: f64) -> Ordering {
        match self {
            Self::Maximize => b.total_cmp(&a),
            Self::Minimize => a.total_cmp(&b),
        }
    }
}

/// A summary column that runs can be ranked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Final test accuracy
    TestAccuracy,
    /// Best validation accuracy
    ValidAccuracy,
    /// Last training loss
    TrainLoss,
    /// Training wall time
    TrainTime,
    /// Peak accelerator memory
    MemoryMax,
    /// Saved adapter size
    FileSize,
    /// Trainable parameter count
    TrainableParams,
}

impl Metric {
    /// All metrics, in display order.
    pub const ALL: [Metric; 7] = [
        Self::TestAccuracy,
        Self::ValidAccuracy,
        Self::TrainLoss,
        Self::TrainTime,
        Self::MemoryMax,
        Self::FileSize,
        Self::TrainableParams,
    ];

    /// Value of this metric for a run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value(self, summary: &RunSummary) -> Option<f64> {
        match self {
            Self::TestAccuracy => summary.test_accuracy,
            Self::ValidAccuracy => summary.best_valid_accuracy,
            Self::TrainLoss => summary.final_train_loss,
            Self::TrainTime => Some(summary.train_time),
            Self::MemoryMax => Some(summary.accelerator_memory_max as f64),
            Self::FileSize => Some(summary.file_size as f64),
            Self::TrainableParams => Some(summary.num_trainable_params as f64),
        }
    }

    /// Natural optimization direction.
    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            Self::TestAccuracy | Self::ValidAccuracy => Direction::Maximize,
            _ => Direction::Minimize,
        }
    }

    /// Command line name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestAccuracy => "test_accuracy",
            Self::ValidAccuracy => "valid_accuracy",
            Self::TrainLoss => "train_loss",
            Self::TrainTime => "train_time",
            Self::MemoryMax => "memory_max",
            Self::FileSize => "file_size",
            Self::TrainableParams => "trainable_params",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = PeftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
                PeftError::InvalidConfig(format!(
                    "unknown metric '{s}', expected one of: {}",
                    known.join(", ")
                ))
            })
    }
}

/// Sort best first by `metric` in its natural direction. Runs without a
/// value go last; ties keep their order.
pub fn sort_by_metric(summaries: &mut [RunSummary], metric: Metric) {
    let direction = metric.direction();
    summaries.sort_by(|a, b| match (metric.value(a), metric.value(b)) {
        (Some(x), Some(y)) => direction.compare(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Successful runs not dominated on `(x, y)`, sorted best first along `x`.
///
/// A run is dominated when another run is at least as good on both metrics
/// and strictly better on one.
#[must_use]
pub fn pareto_front<'a>(summaries: &'a [RunSummary], x: Metric, y: Metric) -> Vec<&'a RunSummary> {
    let points: Vec<(&RunSummary, f64, f64)> = summaries
        .iter()
        .filter(|s| s.is_success())
        .filter_map(|s| Some((s, x.value(s)?, y.value(s)?)))
        .collect();

    let dominates = |a: (f64, f64), b: (f64, f64)| {
        let cx = x.direction().compare(a.0, b.0);
        let cy = y.direction().compare(a.1, b.1);
        cx != Ordering::Greater && cy != Ordering::Greater && (cx == Ordering::Less || cy == Ordering::Less)
    };

    let mut front: Vec<(&RunSummary, f64, f64)> = points
        .iter()
        .filter(|(_, px, py)| !points.iter().any(|(_, qx, qy)| dominates((*qx, *qy), (*px, *py))))
        .copied()
        .collect();
    front.sort_by(|a, b| x.direction().compare(a.1, b.1));
    front.into_iter().map(|(s, _, _)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, accuracy: Option<f64>, memory: u64) -> RunSummary {
        RunSummary {
            name: name.to_string(),
            peft_type: Some("LORA".to_string()),
            status: TrainStatus::Success,
            test_accuracy: accuracy,
            best_valid_accuracy: accuracy,
            final_train_loss: Some(1.0),
            accelerator_memory_max: memory,
            train_time: 10.0,
            file_size: 100,
            num_trainable_params: 1000,
            trainable_fraction: Some(0.01),
            error_msg: String::new(),
        }
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("memory_max".parse::<Metric>().ok(), Some(Metric::MemoryMax));
        assert!("accuracy".parse::<Metric>().is_err());
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>().ok(), Some(metric));
        }
    }

    #[test]
    fn test_sort_by_accuracy_puts_missing_last() {
        let mut runs = vec![
            summary("a", Some(0.3), 1),
            summary("b", None, 1),
            summary("c", Some(0.5), 1),
        ];
        sort_by_metric(&mut runs, Metric::TestAccuracy);
        let names: Vec<&str> = runs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_sort_by_memory_ascending() {
        let mut runs = vec![summary("a", None, 30), summary("b", None, 10)];
        sort_by_metric(&mut runs, Metric::MemoryMax);
        assert_eq!(runs[0].name, "b");
    }

    #[test]
    fn test_pareto_front() {
        let mut failed = summary("failed", Some(0.9), 1);
        failed.status = TrainStatus::Failed;
        let runs = vec![
            summary("small", Some(0.30), 10),
            summary("dominated", Some(0.25), 20),
            summary("large", Some(0.50), 40),
            summary("tie", Some(0.50), 40),
            summary("no_accuracy", None, 1),
            failed,
        ];
        let front = pareto_front(&runs, Metric::MemoryMax, Metric::TestAccuracy);
        let names: Vec<&str> = front.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["small", "large", "tie"]);
    }
}
