use crate::aggregate::finalize;
use crate::clock::Clock;
use crate::error::SinkError;
use crate::model::{Aggregate, Anomaly, Severity};
use crate::retry::{with_retry, RetryPolicy};
use crate::sink::ResultSink;
use crate::stats::PipelineStats;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_ANOMALY_LOOKBACK_DAYS: i64 = 7;

/// Half-open `[start, end)` range of bucket starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn last(span: ChronoDuration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - span,
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// One bucket of a trend, with the derived statistics filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

impl From<&Aggregate> for TrendPoint {
    fn from(aggregate: &Aggregate) -> Self {
        let view = finalize(aggregate);
        Self {
            bucket_start: aggregate.bucket_start,
            count: aggregate.count,
            mean: view.mean,
            stddev: view.stddev,
            min: aggregate.min,
            max: aggregate.max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricTotal {
    pub metric_name: String,
    pub buckets: usize,
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
}

/// Read side used by the dashboard layer.
pub struct QueryService {
    sink: Arc<dyn ResultSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
}

impl QueryService {
    /// `stats` receives the read path's retry counts; share the pipeline's
    /// handle to see reads and writes together.
    pub fn new(
        sink: Arc<dyn ResultSink>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            sink,
            clock,
            retry,
            stats,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Anomalies at or above `min_severity`, newest bucket first. Without
    /// `since`, the last seven days.
    pub async fn recent_anomalies(
        &self,
        since: Option<DateTime<Utc>>,
        min_severity: Severity,
    ) -> Result<Vec<Anomaly>, SinkError> {
        let since = since.unwrap_or_else(|| {
            self.clock.now() - ChronoDuration::days(DEFAULT_ANOMALY_LOOKBACK_DAYS)
        });
        let mut anomalies = with_retry(&self.retry, &self.stats, "list_anomalies", || {
            self.sink.list_anomalies(since)
        })
        .await?;
        anomalies.retain(|anomaly| anomaly.severity >= min_severity);
        anomalies.sort_by(|a, b| {
            b.bucket_start
                .cmp(&a.bucket_start)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        Ok(anomalies)
    }

    /// Aggregates of `metric_name` whose bucket starts inside `range`, oldest first.
    pub async fn trend(&self, metric_name: &str, range: TimeRange) -> Result<Vec<Aggregate>, SinkError> {
        let mut series = with_retry(&self.retry, &self.stats, "list_series", || {
            self.sink.list_series(metric_name, range.start)
        })
        .await?;
        series.retain(|aggregate| range.contains(aggregate.bucket_start));
        Ok(series)
    }

    pub async fn trend_points(&self, metric_name: &str, range: TimeRange) -> Result<Vec<TrendPoint>, SinkError> {
        let series = self.trend(metric_name, range).await?;
        Ok(series.iter().map(TrendPoint::from).collect())
    }

    /// Per-metric totals over `range`, for every metric with data in it.
    pub async fn metric_totals(&self, range: TimeRange) -> Result<Vec<MetricTotal>, SinkError> {
        let names = with_retry(&self.retry, &self.stats, "list_metric_names", || {
            self.sink.list_metric_names()
        })
        .await?;

        let mut totals = Vec::with_capacity(names.len());
        for metric_name in names {
            let series = self.trend(&metric_name, range).await?;
            if series.is_empty() {
                continue;
            }
            let count: u64 = series.iter().map(|aggregate| aggregate.count).sum();
            let sum: f64 = series.iter().map(|aggregate| aggregate.sum).sum();
            totals.push(MetricTotal {
                buckets: series.len(),
                mean: if count == 0 { 0.0 } else { sum / count as f64 },
                metric_name,
                count,
                sum,
            });
        }
        Ok(totals)
    }
}
