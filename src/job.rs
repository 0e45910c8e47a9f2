use crate::detect::DetectionStatus;
use crate::error::JobError;
use crate::model::MetricSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Normalizing,
    Aggregating,
    Detecting,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Normalizing => "normalizing",
            JobStage::Aggregating => "aggregating",
            JobStage::Detecting => "detecting",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }

    /// The stage that follows on success. Terminal stages have none.
    pub fn next(&self) -> Option<JobStage> {
        match self {
            JobStage::Normalizing => Some(JobStage::Aggregating),
            JobStage::Aggregating => Some(JobStage::Detecting),
            JobStage::Detecting => Some(JobStage::Done),
            JobStage::Done | JobStage::Failed => None,
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub record_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

/// How many buckets ended up in each detection status during the last
/// detection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionTally {
    pub normal: u64,
    pub anomalous: u64,
    pub insufficient_data: u64,
    pub unknown: u64,
}

impl DetectionTally {
    pub fn record(&mut self, status: DetectionStatus) {
        match status {
            DetectionStatus::Normal => self.normal += 1,
            DetectionStatus::Anomalous(_) => self.anomalous += 1,
            DetectionStatus::InsufficientData => self.insufficient_data += 1,
            DetectionStatus::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub stage: JobStage,
    pub input_batch_ref: String,
    pub errors: Vec<RecordError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed: u64,
    pub rejected: u64,
    pub duplicates_skipped: u64,
    pub buckets_written: u64,
    pub anomalies_written: u64,
    pub anomalies_cleared: u64,
    pub detections: DetectionTally,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Stage the job was in when it failed; where a plain re-run resumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<JobStage>,
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(job_id: impl Into<String>, input_batch_ref: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            stage: JobStage::Normalizing,
            input_batch_ref: input_batch_ref.into(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            processed: 0,
            rejected: 0,
            duplicates_skipped: 0,
            buckets_written: 0,
            anomalies_written: 0,
            anomalies_cleared: 0,
            detections: DetectionTally::default(),
            failure: None,
            failed_stage: None,
            cancel_requested: false,
        }
    }

    /// Move one step forward. Stages never regress here; see [`Job::retry_from`].
    pub fn advance(&mut self, to: JobStage, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.stage.is_terminal() {
            return Err(JobError::Terminal {
                job_id: self.job_id.clone(),
                stage: self.stage,
            });
        }
        if to != JobStage::Failed && self.stage.next() != Some(to) {
            return Err(JobError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, code: &str, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), JobError> {
        let failed_in = self.stage;
        self.advance(JobStage::Failed, now)?;
        self.failed_stage = Some(failed_in);
        self.failure = Some(JobFailure {
            code: code.to_string(),
            message: message.into(),
        });
        Ok(())
    }

    /// Explicitly rewind to `stage`. A failed job may rewind to the stage it
    /// failed in or earlier, a finished job to any stage, a live job only to
    /// a stage it has already passed.
    pub fn retry_from(&mut self, stage: JobStage, now: DateTime<Utc>) -> Result<(), JobError> {
        let limit = match self.stage {
            JobStage::Failed => self.failed_stage.unwrap_or(JobStage::Normalizing),
            JobStage::Done => JobStage::Detecting,
            live => live,
        };
        if stage.is_terminal() || stage > limit {
            return Err(JobError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.stage,
                to: stage,
            });
        }
        if stage == JobStage::Normalizing {
            self.errors.clear();
            self.processed = 0;
            self.rejected = 0;
        }
        self.stage = stage;
        self.failure = None;
        self.failed_stage = None;
        self.cancel_requested = false;
        self.updated_at = now;
        Ok(())
    }

    /// Stage a plain re-run should start from.
    pub fn resume_stage(&self) -> Option<JobStage> {
        match self.stage {
            JobStage::Done => None,
            JobStage::Failed => self.failed_stage,
            live => Some(live),
        }
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} records processed, {} rejected",
            self.processed, self.rejected
        );
        match (&self.stage, &self.failure) {
            (JobStage::Failed, Some(failure)) => {
                let stage = self.failed_stage.map(|s| s.as_str()).unwrap_or("unknown");
                summary.push_str(&format!(
                    "; failed during {stage} ({}): {}",
                    failure.code, failure.message
                ));
            }
            (JobStage::Done, _) => summary.push_str(&format!(
                "; {} buckets written, {} anomalies",
                self.buckets_written, self.anomalies_written
            )),
            (stage, _) => summary.push_str(&format!("; currently {stage}")),
        }
        summary
    }
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    samples: Option<Arc<Vec<MetricSample>>>,
    running: bool,
}

/// Registry of jobs owned by one orchestrator. Created at service start; on
/// [`JobStore::shutdown`] every job's cancellation token fires.
pub struct JobStore {
    jobs: Mutex<HashMap<String, JobEntry>>,
    shutdown: CancellationToken,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn create(&self, input_batch_ref: &str, now: DateTime<Utc>) -> Job {
        let job = Job::new(Uuid::new_v4().to_string(), input_batch_ref, now);
        let entry = JobEntry {
            job: job.clone(),
            cancel: self.shutdown.child_token(),
            samples: None,
            running: false,
        };
        self.jobs.lock().await.insert(job.job_id.clone(), entry);
        job
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, JobError> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut list: Vec<Job> = jobs.values().map(|entry| entry.job.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        list
    }

    /// Apply `f` to the stored job under the registry lock. Cached samples
    /// are released once the job is `done`.
    pub async fn update<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut Job) -> Result<R, JobError>,
    ) -> Result<R, JobError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let result = f(&mut entry.job);
        if entry.job.stage == JobStage::Done {
            entry.samples = None;
        }
        result
    }

    /// Mark a job as running and hand out its cancellation token.
    pub async fn claim(&self, job_id: &str) -> Result<(Job, CancellationToken), JobError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if entry.running {
            return Err(JobError::Busy(job_id.to_string()));
        }
        entry.running = true;
        Ok((entry.job.clone(), entry.cancel.clone()))
    }

    pub async fn release(&self, job_id: &str) {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.running = false;
        }
    }

    /// Request cancellation. Takes effect at the next stage boundary.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if entry.job.stage.is_terminal() {
            return Err(JobError::Terminal {
                job_id: job_id.to_string(),
                stage: entry.job.stage,
            });
        }
        entry.job.cancel_requested = true;
        entry.cancel.cancel();
        Ok(entry.job.clone())
    }

    /// Rewind a job and give it a fresh cancellation token.
    pub async fn retry_from(&self, job_id: &str, stage: JobStage, now: DateTime<Utc>) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if entry.running {
            return Err(JobError::Busy(job_id.to_string()));
        }
        entry.job.retry_from(stage, now)?;
        if stage == JobStage::Normalizing {
            entry.samples = None;
        }
        if entry.cancel.is_cancelled() && !self.shutdown.is_cancelled() {
            entry.cancel = self.shutdown.child_token();
        }
        Ok(entry.job.clone())
    }

    pub async fn store_samples(&self, job_id: &str, samples: Arc<Vec<MetricSample>>) {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.samples = Some(samples);
        }
    }

    pub async fn samples(&self, job_id: &str) -> Option<Arc<Vec<MetricSample>>> {
        self.jobs.lock().await.get(job_id).and_then(|entry| entry.samples.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn stages_advance_one_step_at_a_time() {
        let mut job = Job::new("j1", "upload.csv", now());
        assert!(matches!(
            job.advance(JobStage::Detecting, now()),
            Err(JobError::InvalidTransition { .. })
        ));
        job.advance(JobStage::Aggregating, now()).unwrap();
        job.advance(JobStage::Detecting, now()).unwrap();
        job.advance(JobStage::Done, now()).unwrap();
        assert!(matches!(
            job.advance(JobStage::Failed, now()),
            Err(JobError::Terminal { .. })
        ));
    }

    #[test]
    fn failed_job_resumes_from_the_failed_stage_only_via_retry() {
        let mut job = Job::new("j1", "upload.csv", now());
        job.advance(JobStage::Aggregating, now()).unwrap();
        job.fail("collaborator_unavailable", "sink down", now()).unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert_eq!(job.resume_stage(), Some(JobStage::Aggregating));
        assert!(job.summary().contains("failed during aggregating"));

        assert!(job.retry_from(JobStage::Detecting, now()).is_err());
        job.retry_from(JobStage::Aggregating, now()).unwrap();
        assert_eq!(job.stage, JobStage::Aggregating);
        assert!(job.failure.is_none());
    }

    #[test]
    fn retry_from_normalizing_resets_record_counts() {
        let mut job = Job::new("j1", "upload.csv", now());
        job.processed = 4;
        job.rejected = 1;
        job.errors.push(RecordError {
            record_id: "row-3".into(),
            reason: "bad".into(),
        });
        job.advance(JobStage::Aggregating, now()).unwrap();
        job.retry_from(JobStage::Normalizing, now()).unwrap();
        assert_eq!(job.processed, 0);
        assert!(job.errors.is_empty());
    }

    #[tokio::test]
    async fn store_claims_cancels_and_shuts_down() {
        let store = JobStore::new();
        let job = store.create("upload.csv", now()).await;
        let (_, token) = store.claim(&job.job_id).await.unwrap();
        assert!(matches!(store.claim(&job.job_id).await, Err(JobError::Busy(_))));
        store.release(&job.job_id).await;

        let cancelled = store.cancel(&job.job_id).await.unwrap();
        assert!(cancelled.cancel_requested);
        assert!(token.is_cancelled());

        let other = store.create("second.csv", now()).await;
        let (_, other_token) = store.claim(&other.job_id).await.unwrap();
        store.shutdown();
        assert!(other_token.is_cancelled());
        assert!(matches!(store.get("missing").await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn cached_samples_are_released_when_the_job_is_done() {
        let store = JobStore::new();
        let job = store.create("upload.csv", now()).await;
        let sample = MetricSample {
            metric_name: "heart_rate".into(),
            timestamp: now(),
            value: 70.0,
            source_record_id: "a".into(),
        };
        store.store_samples(&job.job_id, Arc::new(vec![sample])).await;

        for stage in [JobStage::Aggregating, JobStage::Detecting] {
            store
                .update(&job.job_id, |job| job.advance(stage, now()))
                .await
                .unwrap();
            assert_eq!(store.samples(&job.job_id).await.map(|s| s.len()), Some(1));
        }
        store
            .update(&job.job_id, |job| job.advance(JobStage::Done, now()))
            .await
            .unwrap();
        assert!(store.samples(&job.job_id).await.is_none());
    }
}
