mod bucket;
mod merge;

pub use bucket::bucket_start;
pub use merge::{finalize, merge, sum_sq_residual, AggregateView};

use crate::error::SinkError;
use crate::model::{BucketKey, MetricSample};
use crate::retry::{with_retry, RetryPolicy};
use crate::sink::ResultSink;
use crate::stats::PipelineStats;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

const MAX_CONFLICT_ROUNDS: u32 = 16;

/// What one aggregation pass committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationOutcome {
    pub buckets_written: usize,
    pub samples_applied: u64,
    pub duplicates_skipped: u64,
}

impl AggregationOutcome {
    fn absorb(&mut self, other: BucketOutcome) {
        if other.written {
            self.buckets_written += 1;
        }
        self.samples_applied += other.applied;
        self.duplicates_skipped += other.skipped;
    }
}

#[derive(Debug, Default)]
struct BucketOutcome {
    written: bool,
    applied: u64,
    skipped: u64,
}

/// Folds samples into per-bucket aggregates in the sink.
///
/// Samples are grouped by (metric, bucket) and partitioned into shards by a
/// stable hash of that key. Each shard runs on its own task and applies its
/// buckets one after another, so a bucket is never merged concurrently within
/// a job; across jobs the sink's compare-and-set catches the race.
#[derive(Clone)]
pub struct AggregationEngine {
    sink: Arc<dyn ResultSink>,
    retry: RetryPolicy,
    bucket_width: ChronoDuration,
    shards: usize,
    stats: Arc<PipelineStats>,
}

impl AggregationEngine {
    pub fn new(
        sink: Arc<dyn ResultSink>,
        retry: RetryPolicy,
        bucket_width: ChronoDuration,
        shards: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            sink,
            retry,
            bucket_width,
            shards: shards.max(1),
            stats,
        }
    }

    pub fn bucket_width(&self) -> ChronoDuration {
        self.bucket_width
    }

    pub fn key_for(&self, sample: &MetricSample) -> BucketKey {
        BucketKey {
            metric_name: sample.metric_name.clone(),
            bucket_start: bucket_start(sample.timestamp, self.bucket_width),
        }
    }

    /// Earliest bucket each metric in `samples` lands in; detection restarts
    /// from here.
    pub fn earliest_buckets(&self, samples: &[MetricSample]) -> BTreeMap<String, DateTime<Utc>> {
        let mut earliest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for sample in samples {
            let key = self.key_for(sample);
            earliest
                .entry(key.metric_name)
                .and_modify(|start| {
                    if key.bucket_start < *start {
                        *start = key.bucket_start;
                    }
                })
                .or_insert(key.bucket_start);
        }
        earliest
    }

    /// Apply `samples`. `oldest_accepted` is the retention cutoff; buckets
    /// ending before it have their applied-id sets dropped on write.
    pub async fn apply(
        &self,
        samples: &[MetricSample],
        oldest_accepted: DateTime<Utc>,
    ) -> Result<AggregationOutcome, SinkError> {
        let mut grouped: BTreeMap<BucketKey, Vec<MetricSample>> = BTreeMap::new();
        for sample in samples {
            grouped
                .entry(self.key_for(sample))
                .or_default()
                .push(sample.clone());
        }

        let mut outcome = AggregationOutcome::default();

        let mut partitions: Vec<Vec<(BucketKey, Vec<MetricSample>)>> =
            (0..self.shards).map(|_| Vec::new()).collect();
        for (key, bucket_samples) in grouped {
            let shard = shard_for(&key, self.shards);
            partitions[shard].push((key, bucket_samples));
        }

        let mut tasks = JoinSet::new();
        for (shard, partition) in partitions.into_iter().enumerate() {
            if partition.is_empty() {
                continue;
            }
            let engine = self.clone();
            tasks.spawn(async move {
                let mut shard_outcome = AggregationOutcome::default();
                for (key, bucket_samples) in partition {
                    let result = engine
                        .apply_bucket(&key, &bucket_samples, oldest_accepted)
                        .await;
                    match result {
                        Ok(bucket) => shard_outcome.absorb(bucket),
                        Err(err) => {
                            tracing::warn!(shard, bucket = %key, error = %err, "bucket merge failed");
                            return (shard_outcome, Err(err));
                        }
                    }
                }
                (shard_outcome, Ok(()))
            });
        }

        let mut first_error: Option<SinkError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((shard_outcome, result)) => {
                    outcome.buckets_written += shard_outcome.buckets_written;
                    outcome.samples_applied += shard_outcome.samples_applied;
                    outcome.duplicates_skipped += shard_outcome.duplicates_skipped;
                    if let Err(err) = result {
                        first_error.get_or_insert(err);
                    }
                }
                Err(join_err) => {
                    first_error.get_or_insert(SinkError::Backend(format!(
                        "aggregation shard task failed: {join_err}"
                    )));
                }
            }
        }

        PipelineStats::add(&self.stats.duplicates_skipped, outcome.duplicates_skipped);
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Read-merge-write for one bucket. A version conflict means another job
    /// wrote the bucket in between; re-read and merge again.
    async fn apply_bucket(
        &self,
        key: &BucketKey,
        samples: &[MetricSample],
        oldest_accepted: DateTime<Utc>,
    ) -> Result<BucketOutcome, SinkError> {
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            let existing = with_retry(&self.retry, &self.stats, "get_aggregate", || {
                self.sink.get_aggregate(&key.metric_name, key.bucket_start)
            })
            .await?;

            let mut outcome = BucketOutcome::default();
            let mut aggregate = existing.unwrap_or_else(|| {
                crate::model::Aggregate::empty(&key.metric_name, key.bucket_start, self.bucket_width)
            });
            for sample in samples {
                if aggregate.merge_sample(sample) {
                    outcome.applied += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
            if outcome.applied == 0 {
                tracing::debug!(bucket = %key, skipped = outcome.skipped, "bucket already up to date");
                return Ok(outcome);
            }
            aggregate.seal_if_expired(oldest_accepted);

            let written = with_retry(&self.retry, &self.stats, "put_aggregate", || {
                self.sink.put_aggregate(&aggregate)
            })
            .await;
            match written {
                Ok(()) => {
                    outcome.written = true;
                    tracing::trace!(bucket = %key, applied = outcome.applied, "bucket committed");
                    return Ok(outcome);
                }
                Err(SinkError::Conflict { .. }) if rounds < MAX_CONFLICT_ROUNDS => {
                    PipelineStats::add(&self.stats.write_conflicts, 1);
                    tracing::debug!(bucket = %key, rounds, "aggregate changed underneath; re-merging");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Stable shard assignment for a bucket key, identical across processes.
pub fn shard_for(key: &BucketKey, shards: usize) -> usize {
    let shards = shards.max(1);
    let mut hasher = Sha256::new();
    hasher.update(key.metric_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.bucket_start.timestamp_millis().to_be_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}
