use super::ResultSink;
use crate::error::SinkError;
use crate::model::{Aggregate, Anomaly, BucketKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    aggregates: BTreeMap<BucketKey, Aggregate>,
    anomalies: BTreeMap<BucketKey, Anomaly>,
}

/// In-process sink. Backs `--memory` dry runs and the pipeline tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn aggregates(&self) -> Vec<Aggregate> {
        self.state.lock().await.aggregates.values().cloned().collect()
    }

    pub async fn anomalies(&self) -> Vec<Anomaly> {
        self.state.lock().await.anomalies.values().cloned().collect()
    }

    /// Write an aggregate without the version check. Used to seed history.
    pub async fn seed(&self, aggregate: Aggregate) {
        let mut state = self.state.lock().await;
        state.aggregates.insert(aggregate.key(), aggregate);
    }
}

fn key(metric_name: &str, bucket_start: DateTime<Utc>) -> BucketKey {
    BucketKey {
        metric_name: metric_name.to_string(),
        bucket_start,
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn get_aggregate(
        &self,
        metric_name: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<Aggregate>, SinkError> {
        let state = self.state.lock().await;
        Ok(state.aggregates.get(&key(metric_name, bucket_start)).cloned())
    }

    async fn put_aggregate(&self, aggregate: &Aggregate) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        let key = aggregate.key();
        let stored_version = state.aggregates.get(&key).map(|a| a.version).unwrap_or(0);
        if stored_version != aggregate.version {
            return Err(SinkError::Conflict {
                metric_name: aggregate.metric_name.clone(),
                bucket_start: aggregate.bucket_start,
                expected: aggregate.version,
            });
        }
        let mut stored = aggregate.clone();
        stored.version += 1;
        state.aggregates.insert(key, stored);
        Ok(())
    }

    async fn put_anomaly(&self, anomaly: &Anomaly) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.anomalies.insert(anomaly.key(), anomaly.clone());
        Ok(())
    }

    async fn clear_anomaly(
        &self,
        metric_name: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<bool, SinkError> {
        let mut state = self.state.lock().await;
        Ok(state.anomalies.remove(&key(metric_name, bucket_start)).is_some())
    }

    async fn list_series(
        &self,
        metric_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Aggregate>, SinkError> {
        let state = self.state.lock().await;
        let series = state
            .aggregates
            .range(key(metric_name, since)..)
            .take_while(|(k, _)| k.metric_name == metric_name)
            .map(|(_, aggregate)| aggregate.clone())
            .collect();
        Ok(series)
    }

    async fn list_anomalies(&self, since: DateTime<Utc>) -> Result<Vec<Anomaly>, SinkError> {
        let state = self.state.lock().await;
        let mut anomalies: Vec<Anomaly> = state
            .anomalies
            .values()
            .filter(|anomaly| anomaly.bucket_start >= since)
            .cloned()
            .collect();
        anomalies.sort_by(|a, b| {
            a.bucket_start
                .cmp(&b.bucket_start)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        Ok(anomalies)
    }

    async fn list_metric_names(&self) -> Result<Vec<String>, SinkError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .aggregates
            .keys()
            .map(|k| k.metric_name.clone())
            .collect();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, 0, 0).unwrap()
    }

    fn aggregate(metric: &str, start: DateTime<Utc>) -> Aggregate {
        let mut agg = Aggregate::empty(metric, start, ChronoDuration::hours(1));
        agg.count = 1;
        agg.sum = 1.0;
        agg.min = 1.0;
        agg.max = 1.0;
        agg
    }

    #[tokio::test]
    async fn put_aggregate_is_compare_and_set() {
        let sink = MemorySink::new();
        let agg = aggregate("heart_rate", hour(1));
        sink.put_aggregate(&agg).await.unwrap();

        let stored = sink.get_aggregate("heart_rate", hour(1)).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);

        // stale writer still holding version 0
        let err = sink.put_aggregate(&agg).await.unwrap_err();
        assert!(matches!(err, SinkError::Conflict { expected: 0, .. }));

        sink.put_aggregate(&stored).await.unwrap();
        let stored = sink.get_aggregate("heart_rate", hour(1)).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn list_series_is_scoped_to_metric_and_ordered() {
        let sink = MemorySink::new();
        for (metric, h) in [("b", 2), ("a", 3), ("a", 1), ("a", 2), ("c", 0)] {
            sink.seed(aggregate(metric, hour(h))).await;
        }
        let series = sink.list_series("a", hour(2)).await.unwrap();
        let starts: Vec<_> = series.iter().map(|a| a.bucket_start).collect();
        assert_eq!(starts, vec![hour(2), hour(3)]);
        assert!(series.iter().all(|a| a.metric_name == "a"));
        assert_eq!(sink.list_metric_names().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn anomalies_are_keyed_by_bucket() {
        let sink = MemorySink::new();
        let mut anomaly = Anomaly {
            metric_name: "heart_rate".into(),
            bucket_start: hour(4),
            observed_value: 130.0,
            expected_value: 100.0,
            deviation_score: 6.0,
            severity: Severity::High,
            detected_at: hour(5),
        };
        sink.put_anomaly(&anomaly).await.unwrap();
        anomaly.severity = Severity::Low;
        sink.put_anomaly(&anomaly).await.unwrap();

        let stored = sink.list_anomalies(hour(0)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].severity, Severity::Low);

        assert!(sink.clear_anomaly("heart_rate", hour(4)).await.unwrap());
        assert!(sink.list_anomalies(hour(0)).await.unwrap().is_empty());
        assert!(!sink.clear_anomaly("heart_rate", hour(4)).await.unwrap());
    }
}
