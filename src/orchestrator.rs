//! Drives one upload through normalize → aggregate → detect.
//!
//! Each stage commits its output before the job advances, so re-running a
//! job picks up at its recorded stage and repeats only idempotent work.
//! Cancellation is checked at stage boundaries only.

use crate::aggregate::AggregationEngine;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::detect::Detector;
use crate::error::{JobError, PipelineError, SinkError};
use crate::job::{DetectionTally, Job, JobFailure, JobStage, JobStore, RecordError};
use crate::model::MetricSample;
use crate::normalize::{Normalizer, RecordRejection, SchemaDescriptor};
use crate::retry::with_retry;
use crate::sink::ResultSink;
use crate::stats::PipelineStats;
use crate::upload::UploadBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


const CANCELLED_CODE: &str = "cancelled";

/// Externally visible outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub stage: JobStage,
    pub input_batch_ref: String,
    pub processed: u64,
    pub rejected: u64,
    pub duplicates_skipped: u64,
    pub buckets_written: u64,
    pub anomalies_written: u64,
    pub anomalies_cleared: u64,
    pub detections: DetectionTally,
    pub errors: Vec<RecordError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    pub summary: String,
}

impl From<&Job> for JobReport {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            stage: job.stage,
            input_batch_ref: job.input_batch_ref.clone(),
            processed: job.processed,
            rejected: job.rejected,
            duplicates_skipped: job.duplicates_skipped,
            buckets_written: job.buckets_written,
            anomalies_written: job.anomalies_written,
            anomalies_cleared: job.anomalies_cleared,
            detections: job.detections,
            errors: job.errors.clone(),
            failure: job.failure.clone(),
            summary: job.summary(),
        }
    }
}

#[derive(Debug, Default)]
struct MetricDetection {
    tally: DetectionTally,
    written: u64,
    cleared: u64,
}

pub struct Orchestrator {
    config: PipelineConfig,
    normalizer: Normalizer,
    engine: AggregationEngine,
    detector: Detector,
    sink: Arc<dyn ResultSink>,
    jobs: Arc<JobStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        schema: SchemaDescriptor,
        sink: Arc<dyn ResultSink>,
        jobs: Arc<JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let stats = Arc::new(PipelineStats::new());
        let engine = AggregationEngine::new(
            sink.clone(),
            config.retry.clone(),
            config.bucket_width,
            config.aggregation_shards,
            stats.clone(),
        );
        Ok(Self {
            normalizer: Normalizer::new(schema, config.retention_window()),
            detector: Detector::new(config.detector_config()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            engine,
            sink,
            jobs,
            clock,
            stats,
            config,
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Register a job for an upload. Nothing runs until [`Orchestrator::run`].
    pub async fn submit(&self, input_batch_ref: &str) -> Job {
        let job = self.jobs.create(input_batch_ref, self.clock.now()).await;
        tracing::info!(job_id = %job.job_id, batch_ref = %input_batch_ref, "job submitted");
        job
    }

    pub async fn report(&self, job_id: &str) -> Result<JobReport, JobError> {
        Ok(JobReport::from(&self.jobs.get(job_id).await?))
    }

    pub async fn cancel(&self, job_id: &str) -> Result<Job, JobError> {
        let job = self.jobs.cancel(job_id).await?;
        tracing::info!(job_id, stage = %job.stage, "cancellation requested");
        Ok(job)
    }

    /// Rewind a job so the next [`Orchestrator::run`] starts at `stage`.
    pub async fn retry_from(&self, job_id: &str, stage: JobStage) -> Result<Job, JobError> {
        let job = self.jobs.retry_from(job_id, stage, self.clock.now()).await?;
        tracing::info!(job_id, stage = %stage, "job rewound for retry");
        Ok(job)
    }

    /// Run (or resume) a job over `batch`. A job already `done` returns its
    /// report unchanged; a `failed` job resumes at the stage it failed in.
    pub async fn run(&self, job_id: &str, batch: &UploadBatch) -> Result<JobReport, PipelineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| JobError::Cancelled(job_id.to_string()))?;
        let (job, cancel) = self.jobs.claim(job_id).await?;
        let span = tracing::info_span!(
            "pipeline_job",
            job_id = %job.job_id,
            batch_ref = %job.input_batch_ref,
        );
        let result = self.drive(job, cancel, batch).instrument(span).await;
        self.jobs.release(job_id).await;
        result
    }

    async fn drive(
        &self,
        job: Job,
        cancel: CancellationToken,
        batch: &UploadBatch,
    ) -> Result<JobReport, PipelineError> {
        let job_id = job.job_id.clone();
        let Some(mut stage) = job.resume_stage() else {
            tracing::debug!("job already done");
            return Ok(JobReport::from(&job));
        };
        if job.stage == JobStage::Failed {
            let now = self.clock.now();
            self.jobs.update(&job_id, |job| job.retry_from(stage, now)).await?;
        }

        PipelineStats::add(&self.stats.jobs_started, 1);
        tracing::info!(stage = %stage, records = batch.len(), "job running");

        while !stage.is_terminal() {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&job_id, stage).await);
            }
            tracing::info!(stage = %stage, "stage starting");
            let result = match stage {
                JobStage::Normalizing => self.normalize_stage(&job_id, batch).await,
                JobStage::Aggregating => self.aggregate_stage(&job_id, batch).await,
                JobStage::Detecting => self.detect_stage(&job_id, batch).await,
                JobStage::Done | JobStage::Failed => break,
            };
            if let Err(err) = result {
                return Err(self.fail(&job_id, stage, err).await);
            }

            let next = stage.next().unwrap_or(JobStage::Done);
            let now = self.clock.now();
            self.jobs.update(&job_id, |job| job.advance(next, now)).await?;
            stage = next;
        }

        PipelineStats::add(&self.stats.jobs_completed, 1);
        self.stats.clear_error();
        let job = self.jobs.get(&job_id).await?;
        tracing::info!(
            processed = job.processed,
            rejected = job.rejected,
            buckets = job.buckets_written,
            anomalies = job.anomalies_written,
            "job done"
        );
        Ok(JobReport::from(&job))
    }

    async fn cancelled(&self, job_id: &str, stage: JobStage) -> PipelineError {
        let now = self.clock.now();
        let message = format!("cancelled before {stage}");
        if let Err(err) = self
            .jobs
            .update(job_id, |job| job.fail(CANCELLED_CODE, message, now))
            .await
        {
            return err.into();
        }
        PipelineStats::add(&self.stats.jobs_cancelled, 1);
        tracing::info!(stage = %stage, "job cancelled at stage boundary");
        JobError::Cancelled(job_id.to_string()).into()
    }

    async fn fail(&self, job_id: &str, stage: JobStage, err: PipelineError) -> PipelineError {
        let code = match &err {
            PipelineError::Stage { source, .. } => source.code(),
            PipelineError::Worker { .. } => "worker_failed",
            PipelineError::Job(_) => "job_error",
            PipelineError::Config(_) => "config_error",
        };
        let message = err.to_string();
        let now = self.clock.now();
        if let Err(update_err) = self
            .jobs
            .update(job_id, |job| job.fail(code, message.clone(), now))
            .await
        {
            tracing::warn!(error = %update_err, "could not record job failure");
        }
        PipelineStats::add(&self.stats.jobs_failed, 1);
        self.stats.record_error(format!("job {job_id}: {message}"));
        tracing::error!(stage = %stage, code, error = %err, "job failed");
        err
    }

    /// Normalize every record, fanning chunks out to blocking workers, then
    /// record the accepted samples and per-record errors on the job.
    async fn normalize_stage(&self, job_id: &str, batch: &UploadBatch) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let (samples, rejected) = self.normalize_records(batch, now).await?;

        let mut errors: Vec<RecordError> = batch
            .rejected
            .iter()
            .chain(rejected.iter())
            .map(|rejection| RecordError {
                record_id: rejection.record_id.clone(),
                reason: rejection.error.to_string(),
            })
            .collect();
        let processed = samples.len() as u64;
        let rejected_count = errors.len() as u64;

        PipelineStats::add(&self.stats.records_accepted, processed);
        PipelineStats::add(&self.stats.records_rejected, rejected_count);
        self.jobs.store_samples(job_id, Arc::new(samples)).await;
        self.jobs
            .update(job_id, |job| {
                job.processed = processed;
                job.rejected = rejected_count;
                job.errors = std::mem::take(&mut errors);
                Ok(())
            })
            .await?;
        tracing::info!(processed, rejected = rejected_count, "normalization committed");
        Ok(())
    }

    async fn normalize_records(
        &self,
        batch: &UploadBatch,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MetricSample>, Vec<RecordRejection>), PipelineError> {
        let chunk_size = self.config.normalize_chunk_size.max(1);
        let mut tasks = JoinSet::new();
        for (index, chunk) in batch.records.chunks(chunk_size).enumerate() {
            let chunk = chunk.to_vec();
            let normalizer = self.normalizer.clone();
            tasks.spawn_blocking(move || (index, normalizer.normalize_batch(&chunk, now)));
        }

        let mut chunks = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let chunk = joined.map_err(|err| PipelineError::Worker {
                stage: JobStage::Normalizing,
                message: err.to_string(),
            })?;
            chunks.push(chunk);
        }
        chunks.sort_by_key(|(index, _)| *index);

        let mut samples = Vec::with_capacity(batch.records.len());
        let mut rejected = Vec::new();
        for (_, normalized) in chunks {
            samples.extend(normalized.samples);
            rejected.extend(normalized.rejected);
        }
        Ok((samples, rejected))
    }

    /// Samples committed by the normalize stage. Normalization is pure, so
    /// if they are no longer cached (resume after restart) they are rebuilt
    /// from the batch without touching the job's record counts.
    async fn samples_for(
        &self,
        job_id: &str,
        batch: &UploadBatch,
    ) -> Result<Arc<Vec<MetricSample>>, PipelineError> {
        if let Some(samples) = self.jobs.samples(job_id).await {
            return Ok(samples);
        }
        tracing::debug!("re-normalizing batch for resumed job");
        let (samples, _) = self.normalize_records(batch, self.clock.now()).await?;
        let samples = Arc::new(samples);
        self.jobs.store_samples(job_id, samples.clone()).await;
        Ok(samples)
    }

    async fn aggregate_stage(&self, job_id: &str, batch: &UploadBatch) -> Result<(), PipelineError> {
        let samples = self.samples_for(job_id, batch).await?;
        let oldest = self.config.retention_window().oldest(self.clock.now());
        let outcome = self
            .engine
            .apply(&samples, oldest)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: JobStage::Aggregating,
                source,
            })?;

        self.jobs
            .update(job_id, |job| {
                job.buckets_written += outcome.buckets_written as u64;
                job.duplicates_skipped += outcome.duplicates_skipped;
                Ok(())
            })
            .await?;
        tracing::info!(
            buckets = outcome.buckets_written,
            applied = outcome.samples_applied,
            duplicates = outcome.duplicates_skipped,
            "aggregation committed"
        );
        Ok(())
    }

    /// Re-run detection for every metric the batch touched, from its
    /// earliest bucket onward, one metric per concurrent future.
    async fn detect_stage(&self, job_id: &str, batch: &UploadBatch) -> Result<(), PipelineError> {
        let samples = self.samples_for(job_id, batch).await?;
        let touched = self.engine.earliest_buckets(&samples);
        let detected_at = self.clock.now();

        let results = futures::future::join_all(
            touched
                .iter()
                .map(|(metric, from)| self.detect_metric(metric, *from, detected_at)),
        )
        .await;

        let mut total = MetricDetection::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(metric) => {
                    total.written += metric.written;
                    total.cleared += metric.cleared;
                    total.tally.normal += metric.tally.normal;
                    total.tally.anomalous += metric.tally.anomalous;
                    total.tally.insufficient_data += metric.tally.insufficient_data;
                    total.tally.unknown += metric.tally.unknown;
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(source) = first_error {
            return Err(PipelineError::Stage {
                stage: JobStage::Detecting,
                source,
            });
        }

        self.jobs
            .update(job_id, |job| {
                job.anomalies_written = total.written;
                job.anomalies_cleared = total.cleared;
                job.detections = total.tally;
                Ok(())
            })
            .await?;
        tracing::info!(
            metrics = touched.len(),
            anomalies = total.written,
            cleared = total.cleared,
            "detection committed"
        );
        Ok(())
    }

    async fn detect_metric(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        detected_at: DateTime<Utc>,
    ) -> Result<MetricDetection, SinkError> {
        let lookback = i32::try_from(self.config.lookback_buckets()).unwrap_or(i32::MAX);
        let since = from - self.config.bucket_width * lookback;
        let series = with_retry(&self.config.retry, &self.stats, "list_series", || {
            self.sink.list_series(metric, since)
        })
        .await?;

        let mut outcome = MetricDetection::default();
        for detection in self.detector.detect(&series) {
            if detection.bucket_start < from {
                continue;
            }
            outcome.tally.record(detection.status);
            match detection.to_anomaly(detected_at) {
                Some(anomaly) => {
                    with_retry(&self.config.retry, &self.stats, "put_anomaly", || {
                        self.sink.put_anomaly(&anomaly)
                    })
                    .await?;
                    tracing::debug!(
                        metric,
                        bucket = %anomaly.bucket_start,
                        severity = %anomaly.severity,
                        score = anomaly.deviation_score,
                        "anomaly recorded"
                    );
                    outcome.written += 1;
                }
                None => {
                    let removed = with_retry(&self.config.retry, &self.stats, "clear_anomaly", || {
                        self.sink.clear_anomaly(metric, detection.bucket_start)
                    })
                    .await?;
                    if removed {
                        outcome.cleared += 1;
                    }
                }
            }
        }
        Ok(outcome)
    }
}
