//! Result Sink contract: the only place aggregates and anomalies are
//! persisted, and the only coordination point between concurrent jobs.
//!
//! Writes are per bucket; nothing here assumes multi-key transactions.
//! `put_aggregate` is a compare-and-set on [`Aggregate::version`]: the caller
//! passes the aggregate carrying the version it read (0 when absent) and the
//! sink stores it with the version incremented, or returns
//! [`SinkError::Conflict`] if someone else wrote in between.

mod memory;
mod pg;

pub use memory::MemorySink;
pub use pg::PgSink;

use crate::error::SinkError;
use crate::model::{Aggregate, Anomaly};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn get_aggregate(
        &self,
        metric_name: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<Aggregate>, SinkError>;

    async fn put_aggregate(&self, aggregate: &Aggregate) -> Result<(), SinkError>;

    async fn put_anomaly(&self, anomaly: &Anomaly) -> Result<(), SinkError>;

    /// Remove a stored anomaly for a bucket that re-detection no longer flags.
    /// Returns whether one was present.
    async fn clear_anomaly(
        &self,
        metric_name: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<bool, SinkError>;

    /// Aggregates for `metric_name` with `bucket_start >= since`, oldest first.
    async fn list_series(
        &self,
        metric_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Aggregate>, SinkError>;

    /// Anomalies with `bucket_start >= since`, oldest first.
    async fn list_anomalies(&self, since: DateTime<Utc>) -> Result<Vec<Anomaly>, SinkError>;

    async fn list_metric_names(&self) -> Result<Vec<String>, SinkError>;
}
