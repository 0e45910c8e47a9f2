use super::bucket::bucket_start;
use crate::model::{Aggregate, MetricSample};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

/// Derived statistics for one bucket. Variance is the population variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateView {
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
}

impl Aggregate {
    /// Fold one sample in. Returns `false` (and changes nothing) when the
    /// sample's record id was already applied to this bucket.
    pub fn merge_sample(&mut self, sample: &MetricSample) -> bool {
        if !self.applied.insert(sample.source_record_id.clone()) {
            return false;
        }
        let value = sample.value;
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        true
    }

    /// Forget applied record ids once the bucket has aged out of the
    /// retention window; the normalizer rejects anything that old, so no
    /// duplicate can reach it anymore.
    pub fn seal_if_expired(&mut self, oldest_accepted: DateTime<Utc>) -> bool {
        if self.applied.is_empty() || self.bucket_end() > oldest_accepted {
            return false;
        }
        self.applied.clear();
        true
    }
}

/// Merge one sample into an existing aggregate, or start a new one for the
/// sample's bucket.
pub fn merge(existing: Option<Aggregate>, sample: &MetricSample, bucket_width: ChronoDuration) -> Aggregate {
    let mut aggregate = existing.unwrap_or_else(|| {
        Aggregate::empty(
            &sample.metric_name,
            bucket_start(sample.timestamp, bucket_width),
            bucket_width,
        )
    });
    aggregate.merge_sample(sample);
    aggregate
}

pub fn finalize(aggregate: &Aggregate) -> AggregateView {
    if aggregate.count == 0 {
        return AggregateView {
            mean: 0.0,
            variance: 0.0,
            stddev: 0.0,
        };
    }
    let mut variance = aggregate.m2 / aggregate.count as f64;
    if variance < 0.0 || !variance.is_finite() {
        tracing::trace!(
            metric = %aggregate.metric_name,
            bucket = %aggregate.bucket_start,
            m2 = aggregate.m2,
            "clamping negative variance"
        );
        variance = 0.0;
    }
    AggregateView {
        mean: aggregate.mean,
        variance,
        stddev: variance.sqrt(),
    }
}

/// `sum_sq - sum^2 / count`, clamped at zero against floating-point drift.
pub fn sum_sq_residual(aggregate: &Aggregate) -> f64 {
    if aggregate.count == 0 {
        return 0.0;
    }
    let residual = aggregate.sum_sq - aggregate.sum * aggregate.sum / aggregate.count as f64;
    residual.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str, minute: u32, value: f64) -> MetricSample {
        MetricSample {
            metric_name: "heart_rate".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap(),
            value,
            source_record_id: id.to_string(),
        }
    }

    fn fold(samples: &[MetricSample]) -> Aggregate {
        samples
            .iter()
            .fold(None, |acc, s| Some(merge(acc, s, ChronoDuration::hours(1))))
            .unwrap()
    }

    #[test]
    fn three_heart_rate_samples_fold_into_one_bucket() {
        let agg = fold(&[sample("a", 5, 70.0), sample("b", 20, 72.0), sample("c", 40, 71.0)]);
        assert_eq!(agg.count, 3);
        assert_eq!(agg.sum, 213.0);
        assert_eq!(agg.min, 70.0);
        assert_eq!(agg.max, 72.0);
        assert_eq!(agg.bucket_start, Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());

        let view = finalize(&agg);
        assert!((view.mean - 71.0).abs() < 1e-12);
        assert!((view.variance - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn merge_is_order_independent() {
        let a = sample("a", 1, 3.5);
        let b = sample("b", 2, -1.25);
        let c = sample("c", 3, 10.0);
        let reference = fold(&[a.clone(), b.clone(), c.clone()]);
        let orders = [
            [a.clone(), c.clone(), b.clone()],
            [b.clone(), a.clone(), c.clone()],
            [b.clone(), c.clone(), a.clone()],
            [c.clone(), a.clone(), b.clone()],
            [c.clone(), b.clone(), a.clone()],
        ];
        for order in orders {
            let agg = fold(&order);
            assert_eq!(agg.count, reference.count);
            assert_eq!(agg.min, reference.min);
            assert_eq!(agg.max, reference.max);
            assert_eq!(agg.applied, reference.applied);
            assert!((agg.sum - reference.sum).abs() < 1e-9);
            assert!((agg.sum_sq - reference.sum_sq).abs() < 1e-9);
            assert!((finalize(&agg).variance - finalize(&reference).variance).abs() < 1e-9);
        }
    }

    #[test]
    fn remerging_the_same_record_is_a_no_op() {
        let mut agg = fold(&[sample("a", 5, 70.0)]);
        assert!(!agg.merge_sample(&sample("a", 5, 70.0)));
        assert_eq!(agg.count, 1);
        assert_eq!(agg.sum, 70.0);
    }

    #[test]
    fn variance_survives_large_offsets() {
        // naive sum_sq/n - mean^2 loses every digit here
        let base = 1.0e9;
        let agg = fold(&[
            sample("a", 1, base + 4.0),
            sample("b", 2, base + 7.0),
            sample("c", 3, base + 13.0),
            sample("d", 4, base + 16.0),
        ]);
        let view = finalize(&agg);
        assert!((view.variance - 22.5).abs() < 1e-6);
        assert!(sum_sq_residual(&agg) >= 0.0);
    }

    #[test]
    fn seal_clears_ids_only_after_retention() {
        let mut agg = fold(&[sample("a", 5, 70.0)]);
        let inside = Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap();
        assert!(!agg.seal_if_expired(inside));
        assert_eq!(agg.applied.len(), 1);

        let after = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        assert!(agg.seal_if_expired(after));
        assert!(agg.applied.is_empty());
        assert_eq!(agg.count, 1);
    }

    #[test]
    fn finalize_clamps_negative_variance() {
        let mut agg = fold(&[sample("a", 5, 70.0)]);
        agg.m2 = -1e-12;
        assert_eq!(finalize(&agg).variance, 0.0);
    }
}
