//! Trailing-window z-score detector.
//!
//! For each bucket of one metric's series, the expected value is the mean of
//! the previous `window` eligible bucket means and the deviation score is
//! `(observed - expected) / max(stddev, epsilon)`, using the population
//! standard deviation of those means. The detector keeps no state between
//! calls: give it the same series and it returns the same findings.

use crate::aggregate::finalize;
use crate::model::{Aggregate, Anomaly, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: 2.0,
            medium: 3.0,
            high: 4.0,
        }
    }
}

impl SeverityThresholds {
    /// Closed-open bands on `|score|`: `[low, medium)` is low, `[medium, high)`
    /// is medium, `>= high` is high, anything below `low` is not an anomaly.
    pub fn classify(&self, score: f64) -> Option<Severity> {
        let magnitude = score.abs();
        if !magnitude.is_finite() {
            return if magnitude.is_nan() {
                None
            } else {
                Some(Severity::High)
            };
        }
        if magnitude >= self.high {
            Some(Severity::High)
        } else if magnitude >= self.medium {
            Some(Severity::Medium)
        } else if magnitude >= self.low {
            Some(Severity::Low)
        } else {
            None
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.low > 0.0 && self.low < self.medium && self.medium < self.high
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub window: usize,
    pub minimum_sample_threshold: u64,
    pub thresholds: SeverityThresholds,
    pub epsilon: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: 10,
            minimum_sample_threshold: 1,
            thresholds: SeverityThresholds::default(),
            epsilon: 1e-9,
        }
    }
}

/// Fewer than `window` prior buckets were available. Reported as
/// [`DetectionStatus::Unknown`], never raised out of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("insufficient history: {have} prior buckets, need {need}")]
pub struct InsufficientHistory {
    pub have: usize,
    pub need: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "severity")]
pub enum DetectionStatus {
    Normal,
    Anomalous(Severity),
    /// Bucket count below the minimum sample threshold.
    InsufficientData,
    /// Not enough history to build a full trailing window.
    Unknown,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Normal => "normal",
            DetectionStatus::Anomalous(_) => "anomalous",
            DetectionStatus::InsufficientData => "insufficient_data",
            DetectionStatus::Unknown => "unknown",
        }
    }
}

/// The detector's verdict for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub metric_name: String,
    pub bucket_start: DateTime<Utc>,
    pub status: DetectionStatus,
    pub observed_value: f64,
    pub expected_value: Option<f64>,
    pub deviation_score: Option<f64>,
    pub history: usize,
}

impl Detection {
    pub fn to_anomaly(&self, detected_at: DateTime<Utc>) -> Option<Anomaly> {
        let DetectionStatus::Anomalous(severity) = self.status else {
            return None;
        };
        Some(Anomaly {
            metric_name: self.metric_name.clone(),
            bucket_start: self.bucket_start,
            observed_value: self.observed_value,
            expected_value: self.expected_value?,
            deviation_score: self.deviation_score?,
            severity,
            detected_at,
        })
    }

    pub fn insufficient_history(&self, window: usize) -> Option<InsufficientHistory> {
        (self.status == DetectionStatus::Unknown).then_some(InsufficientHistory {
            have: self.history,
            need: window,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Evaluate every bucket of a single metric's series. Input order does not
    /// matter; output is ascending by `bucket_start`, one entry per bucket.
    pub fn detect(&self, series: &[Aggregate]) -> Vec<Detection> {
        let mut ordered: Vec<&Aggregate> = series.iter().collect();
        ordered.sort_by_key(|aggregate| aggregate.bucket_start);
        ordered.dedup_by_key(|aggregate| aggregate.bucket_start);

        let window = self.config.window.max(1);
        let mut trailing: VecDeque<f64> = VecDeque::with_capacity(window + 1);
        let mut detections = Vec::with_capacity(ordered.len());

        for aggregate in ordered {
            let observed = finalize(aggregate).mean;
            let mut detection = Detection {
                metric_name: aggregate.metric_name.clone(),
                bucket_start: aggregate.bucket_start,
                status: DetectionStatus::Unknown,
                observed_value: observed,
                expected_value: None,
                deviation_score: None,
                history: trailing.len(),
            };

            if aggregate.count == 0 || aggregate.count < self.config.minimum_sample_threshold {
                detection.status = DetectionStatus::InsufficientData;
                detections.push(detection);
                continue;
            }

            if trailing.len() >= window {
                let (expected, stddev) = mean_and_stddev(&trailing);
                let score = (observed - expected) / stddev.max(self.config.epsilon);
                detection.expected_value = Some(expected);
                detection.deviation_score = Some(score);
                detection.status = match self.config.thresholds.classify(score) {
                    Some(severity) => DetectionStatus::Anomalous(severity),
                    None => DetectionStatus::Normal,
                };
            }

            trailing.push_back(observed);
            if trailing.len() > window {
                trailing.pop_front();
            }
            detections.push(detection);
        }

        detections
    }
}

/// Anomalies for `series` under `config`, stamped with `detected_at`.
pub fn detect(series: &[Aggregate], config: &DetectorConfig, detected_at: DateTime<Utc>) -> Vec<Anomaly> {
    Detector::new(config.clone())
        .detect(series)
        .iter()
        .filter_map(|detection| detection.to_anomaly(detected_at))
        .collect()
}

fn mean_and_stddev(values: &VecDeque<f64>) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.max(0.0).sqrt())
}
