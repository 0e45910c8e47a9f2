use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One validated observation, produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub source_record_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub metric_name: String,
    pub bucket_start: DateTime<Utc>,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.metric_name, self.bucket_start.to_rfc3339())
    }
}

/// Sufficient statistics for one metric within one bucket.
///
/// `mean`/`m2` carry Welford state so variance never has to be recovered from
/// `sum_sq`. `applied` holds the `source_record_id`s already folded in, which
/// is what makes re-ingesting an upload a no-op. `version` is bumped on every
/// successful write and used for compare-and-set in the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub metric_name: String,
    pub bucket_start: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub bucket_width: ChronoDuration,
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub m2: f64,
    #[serde(default)]
    pub applied: BTreeSet<String>,
    #[serde(default)]
    pub version: u64,
}

impl Aggregate {
    pub fn empty(metric_name: &str, bucket_start: DateTime<Utc>, bucket_width: ChronoDuration) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            bucket_start,
            bucket_width,
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
            applied: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            metric_name: self.metric_name.clone(),
            bucket_start: self.bucket_start,
        }
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + self.bucket_width
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity `{other}`")),
        }
    }
}

/// A severity-classified finding for one bucket. At most one exists per
/// (metric_name, bucket_start); re-detection replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric_name: String,
    pub bucket_start: DateTime<Utc>,
    pub observed_value: f64,
    pub expected_value: f64,
    pub deviation_score: f64,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn key(&self) -> BucketKey {
        BucketKey {
            metric_name: self.metric_name.clone(),
            bucket_start: self.bucket_start,
        }
    }
}

pub(crate) mod duration_secs {
    use chrono::Duration as ChronoDuration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &ChronoDuration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ChronoDuration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Ok(ChronoDuration::seconds(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn severity_orders_low_to_high_and_parses() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("critical".parse::<Severity>().is_err());
    }

    #[test]
    fn aggregate_serializes_width_as_seconds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut agg = Aggregate::empty("heart_rate", start, ChronoDuration::hours(1));
        agg.count = 1;
        agg.sum = 70.0;
        agg.sum_sq = 4900.0;
        agg.min = 70.0;
        agg.max = 70.0;
        agg.mean = 70.0;
        let json = serde_json::to_value(&agg).unwrap();
        assert_eq!(json["bucket_width"], 3600);
        let back: Aggregate = serde_json::from_value(json).unwrap();
        assert_eq!(back.bucket_width, ChronoDuration::hours(1));
        assert_eq!(back.bucket_end(), start + ChronoDuration::hours(1));
    }
}
