use crate::error::{ValidationError, ValidationKind};
use crate::model::MetricSample;
use crate::record::{FieldValue, RawRecord};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// How a field of an uploaded record is treated by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Metric,
    Timestamp,
    Value,
    RecordId,
    Optional,
    Ignored,
}

/// Names the fields a batch is expected to carry and the constraints on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaDescriptor {
    pub metric_field: String,
    pub timestamp_field: String,
    pub value_field: String,
    pub record_id_field: Option<String>,
    pub optional_fields: BTreeSet<String>,
    /// Prepended to the metric field's value, e.g. `disease:` turns a
    /// `disease` column into one metric per diagnosis.
    pub metric_prefix: Option<String>,
    /// Value used when the record has no value field. Opt-in; used for
    /// count-style metrics where each record is one occurrence.
    pub implicit_value: Option<f64>,
    /// Inclusive bounds on the value.
    pub value_range: Option<(f64, f64)>,
}

impl Default for SchemaDescriptor {
    fn default() -> Self {
        Self {
            metric_field: "metric_name".to_string(),
            timestamp_field: "timestamp".to_string(),
            value_field: "value".to_string(),
            record_id_field: Some("source_record_id".to_string()),
            optional_fields: BTreeSet::new(),
            metric_prefix: None,
            implicit_value: None,
            value_range: None,
        }
    }
}

impl SchemaDescriptor {
    pub fn classify(&self, field: &str) -> FieldRole {
        if field == self.metric_field {
            FieldRole::Metric
        } else if field == self.timestamp_field {
            FieldRole::Timestamp
        } else if field == self.value_field {
            FieldRole::Value
        } else if self.record_id_field.as_deref() == Some(field) {
            FieldRole::RecordId
        } else if self.optional_fields.contains(field) {
            FieldRole::Optional
        } else {
            FieldRole::Ignored
        }
    }
}

/// Accepted age range for sample timestamps relative to "now".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionWindow {
    pub max_age: ChronoDuration,
    pub max_future_skew: ChronoDuration,
}

impl RetentionWindow {
    pub fn oldest(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRejection {
    pub record_id: String,
    pub error: ValidationError,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub samples: Vec<MetricSample>,
    pub rejected: Vec<RecordRejection>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    schema: SchemaDescriptor,
    retention: RetentionWindow,
}

impl Normalizer {
    pub fn new(schema: SchemaDescriptor, retention: RetentionWindow) -> Self {
        Self { schema, retention }
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn normalize(
        &self,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<MetricSample, ValidationError> {
        let schema = &self.schema;

        let metric_name = match record.present(&schema.metric_field) {
            Some(FieldValue::Text(text)) => text.trim().to_string(),
            Some(FieldValue::Int(i)) => i.to_string(),
            Some(other) => {
                return Err(ValidationError::new(
                    &schema.metric_field,
                    ValidationKind::TypeError,
                    format!("expected text, got {}", other.type_name()),
                ))
            }
            None => return Err(ValidationError::missing(&schema.metric_field)),
        };
        let metric_name = match schema.metric_prefix.as_deref() {
            Some(prefix) => format!("{prefix}{metric_name}"),
            None => metric_name,
        };

        let timestamp = match record.present(&schema.timestamp_field) {
            Some(raw) => parse_timestamp(&schema.timestamp_field, raw)?,
            None => return Err(ValidationError::missing(&schema.timestamp_field)),
        };
        if timestamp < self.retention.oldest(now) {
            return Err(ValidationError::new(
                &schema.timestamp_field,
                ValidationKind::TooOld,
                format!("{} is outside the retention window", timestamp.to_rfc3339()),
            ));
        }
        if timestamp > now + self.retention.max_future_skew {
            return Err(ValidationError::new(
                &schema.timestamp_field,
                ValidationKind::FutureDated,
                format!("{} is in the future", timestamp.to_rfc3339()),
            ));
        }

        let value = match (record.present(&schema.value_field), schema.implicit_value) {
            (Some(raw), _) => coerce_value(&schema.value_field, raw)?,
            (None, Some(implicit)) => implicit,
            (None, None) => return Err(ValidationError::missing(&schema.value_field)),
        };
        if let Some((low, high)) = schema.value_range {
            if value < low || value > high {
                return Err(ValidationError::new(
                    &schema.value_field,
                    ValidationKind::OutOfRange,
                    format!("{value} not within [{low}, {high}]"),
                ));
            }
        }

        let source_record_id = self
            .explicit_record_id(record)
            .unwrap_or_else(|| self.content_id(record));

        Ok(MetricSample {
            metric_name,
            timestamp,
            value,
            source_record_id,
        })
    }

    /// Normalize every record, collecting failures instead of stopping at the
    /// first one.
    pub fn normalize_batch(&self, records: &[RawRecord], now: DateTime<Utc>) -> NormalizedBatch {
        let mut batch = NormalizedBatch {
            samples: Vec::with_capacity(records.len()),
            rejected: Vec::new(),
        };
        for record in records {
            match self.normalize(record, now) {
                Ok(sample) => batch.samples.push(sample),
                Err(error) => {
                    let record_id = self.reported_id(record);
                    tracing::debug!(record_id = %record_id, error = %error, "rejected record");
                    batch.rejected.push(RecordRejection { record_id, error });
                }
            }
        }
        batch
    }

    /// Identifier used when reporting a rejection.
    pub fn reported_id(&self, record: &RawRecord) -> String {
        self.explicit_record_id(record)
            .unwrap_or_else(|| record.fallback_id())
    }

    fn explicit_record_id(&self, record: &RawRecord) -> Option<String> {
        let field = self.schema.record_id_field.as_deref()?;
        match record.present(field)? {
            FieldValue::Text(text) => Some(text.trim().to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    /// Stable identity derived from the row position and the recognised
    /// fields. Replaying the same upload reproduces it; identical rows at
    /// different positions stay distinct.
    fn content_id(&self, record: &RawRecord) -> String {
        let mut payload = format!("row={}\n", record.row);
        for (name, value) in &record.fields {
            if matches!(self.schema.classify(name), FieldRole::Ignored) {
                continue;
            }
            payload.push_str(name);
            payload.push('=');
            payload.push_str(value.type_name());
            payload.push(':');
            payload.push_str(&value.to_string());
            payload.push('\n');
        }
        let digest = Sha256::digest(payload.as_bytes());
        format!("sha256:{digest:x}")
    }
}

fn coerce_value(field: &str, raw: &FieldValue) -> Result<f64, ValidationError> {
    let value = match raw {
        FieldValue::Int(i) => *i as f64,
        FieldValue::Float(v) => *v,
        FieldValue::Text(text) => text.trim().parse::<f64>().map_err(|_| {
            ValidationError::new(
                field,
                ValidationKind::TypeError,
                format!("`{}` is not numeric", text.trim()),
            )
        })?,
        other => {
            return Err(ValidationError::new(
                field,
                ValidationKind::TypeError,
                format!("expected number, got {}", other.type_name()),
            ))
        }
    };
    if !value.is_finite() {
        return Err(ValidationError::new(
            field,
            ValidationKind::TypeError,
            "value must be finite",
        ));
    }
    Ok(value)
}

/// Integers are epoch milliseconds, floats are epoch seconds, text is RFC 3339
/// or a naive `YYYY-MM-DD[ HH:MM:SS]` taken as UTC.
fn parse_timestamp(field: &str, raw: &FieldValue) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |detail: String| ValidationError::new(field, ValidationKind::TypeError, detail);
    match raw {
        FieldValue::Int(ms) => Utc
            .timestamp_millis_opt(*ms)
            .single()
            .ok_or_else(|| invalid(format!("{ms} is not a valid epoch millisecond"))),
        FieldValue::Float(secs) => {
            if !secs.is_finite() {
                return Err(invalid("timestamp must be finite".to_string()));
            }
            Utc.timestamp_millis_opt((secs * 1000.0).round() as i64)
                .single()
                .ok_or_else(|| invalid(format!("{secs} is not a valid epoch second")))
        }
        FieldValue::Text(text) => {
            let text = text.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            Err(invalid(format!("`{text}` is not a recognised timestamp")))
        }
        other => Err(invalid(format!("expected timestamp, got {}", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(
            SchemaDescriptor::default(),
            RetentionWindow {
                max_age: ChronoDuration::days(30),
                max_future_skew: ChronoDuration::minutes(5),
            },
        )
    }

    fn record(value: FieldValue) -> RawRecord {
        RawRecord::new(0)
            .with("metric_name", FieldValue::Text("heart_rate".into()))
            .with("timestamp", FieldValue::Text("2024-06-01T10:15:00Z".into()))
            .with("value", value)
            .with("source_record_id", FieldValue::Text("r-1".into()))
    }

    #[test]
    fn coerces_numeric_strings() {
        let sample = normalizer()
            .normalize(&record(FieldValue::Text(" 72.5 ".into())), now())
            .unwrap();
        assert_eq!(sample.metric_name, "heart_rate");
        assert_eq!(sample.value, 72.5);
        assert_eq!(sample.source_record_id, "r-1");
        assert_eq!(sample.timestamp, Utc.with_ymd_and_hms(2024, 6, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn rejects_non_numeric_value_as_type_error() {
        let err = normalizer()
            .normalize(&record(FieldValue::Text("high".into())), now())
            .unwrap_err();
        assert_eq!(err.field, "value");
        assert_eq!(err.kind, ValidationKind::TypeError);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut rec = record(FieldValue::Int(70));
        rec.fields.remove("timestamp");
        let err = normalizer().normalize(&rec, now()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Missing);
        assert_eq!(err.field, "timestamp");

        let rec = record(FieldValue::Text("   ".into()));
        let err = normalizer().normalize(&rec, now()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Missing);
        assert_eq!(err.field, "value");
    }

    #[test]
    fn enforces_retention_window() {
        let old = record(FieldValue::Int(70))
            .with("timestamp", FieldValue::Text("2024-04-01T00:00:00Z".into()));
        assert_eq!(
            normalizer().normalize(&old, now()).unwrap_err().kind,
            ValidationKind::TooOld
        );

        let future = record(FieldValue::Int(70))
            .with("timestamp", FieldValue::Text("2024-06-01T12:10:00Z".into()));
        assert_eq!(
            normalizer().normalize(&future, now()).unwrap_err().kind,
            ValidationKind::FutureDated
        );

        let skewed = record(FieldValue::Int(70))
            .with("timestamp", FieldValue::Text("2024-06-01T12:04:00Z".into()));
        assert!(normalizer().normalize(&skewed, now()).is_ok());
    }

    #[test]
    fn accepts_epoch_and_naive_timestamps() {
        let n = normalizer();
        let expected = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        for raw in [
            FieldValue::Int(expected.timestamp_millis()),
            FieldValue::Float(expected.timestamp() as f64),
            FieldValue::Text("2024-06-01 10:00:00".into()),
        ] {
            let rec = record(FieldValue::Int(1)).with("timestamp", raw);
            assert_eq!(n.normalize(&rec, now()).unwrap().timestamp, expected);
        }
    }

    #[test]
    fn unknown_fields_are_ignored_and_do_not_change_identity() {
        let n = Normalizer::new(
            SchemaDescriptor {
                record_id_field: None,
                ..SchemaDescriptor::default()
            },
            RetentionWindow {
                max_age: ChronoDuration::days(30),
                max_future_skew: ChronoDuration::minutes(5),
            },
        );
        let base = record(FieldValue::Int(70));
        let noisy = base
            .clone()
            .with("uploaded_by", FieldValue::Text("clinic-7".into()));
        let a = n.normalize(&base, now()).unwrap();
        let b = n.normalize(&noisy, now()).unwrap();
        assert!(a.source_record_id.starts_with("sha256:"));
        assert_eq!(a.source_record_id, b.source_record_id);

        let other = record(FieldValue::Int(71));
        assert_ne!(n.normalize(&other, now()).unwrap().source_record_id, a.source_record_id);

        let mut same_content_next_row = base.clone();
        same_content_next_row.row += 1;
        assert_ne!(
            n.normalize(&same_content_next_row, now()).unwrap().source_record_id,
            a.source_record_id
        );
    }

    #[test]
    fn count_style_schema_prefixes_metric_and_uses_implicit_value() {
        let n = Normalizer::new(
            SchemaDescriptor {
                metric_field: "disease".to_string(),
                record_id_field: Some("patient_id".to_string()),
                metric_prefix: Some("disease:".to_string()),
                implicit_value: Some(1.0),
                ..SchemaDescriptor::default()
            },
            RetentionWindow {
                max_age: ChronoDuration::days(30),
                max_future_skew: ChronoDuration::minutes(5),
            },
        );
        let rec = RawRecord::new(4)
            .with("patient_id", FieldValue::Text("p-9".into()))
            .with("disease", FieldValue::Text("influenza".into()))
            .with("timestamp", FieldValue::Text("2024-06-01T09:00:00Z".into()));
        let sample = n.normalize(&rec, now()).unwrap();
        assert_eq!(sample.metric_name, "disease:influenza");
        assert_eq!(sample.value, 1.0);
        assert_eq!(sample.source_record_id, "p-9");
    }

    #[test]
    fn value_range_is_inclusive() {
        let n = Normalizer::new(
            SchemaDescriptor {
                value_range: Some((0.0, 120.0)),
                ..SchemaDescriptor::default()
            },
            RetentionWindow {
                max_age: ChronoDuration::days(30),
                max_future_skew: ChronoDuration::minutes(5),
            },
        );
        assert!(n.normalize(&record(FieldValue::Int(120)), now()).is_ok());
        let err = n.normalize(&record(FieldValue::Int(121)), now()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::OutOfRange);
    }

    #[test]
    fn batch_collects_rejections_without_aborting() {
        let records = vec![
            record(FieldValue::Int(70)),
            RawRecord::new(1).with("metric_name", FieldValue::Text("heart_rate".into())),
            record(FieldValue::Int(72)).with("source_record_id", FieldValue::Text("r-3".into())),
        ];
        let batch = normalizer().normalize_batch(&records, now());
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].record_id, "row-1");
    }
}
