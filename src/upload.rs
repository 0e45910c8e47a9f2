use crate::error::{ValidationError, ValidationKind};
use crate::normalize::RecordRejection;
use crate::record::{FieldValue, RawRecord};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported upload `{0}`: only .csv files are accepted")]
    UnsupportedFormat(String),
    #[error("upload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("upload has no header row")]
    MissingHeader,
    #[error("failed to read upload header: {0}")]
    Header(#[source] csv::Error),
}

/// Records decoded from one upload. Rows the CSV reader could not parse are
/// reported as rejections instead of failing the whole upload.
#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    pub records: Vec<RawRecord>,
    pub rejected: Vec<RecordRejection>,
}

impl UploadBatch {
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            rejected: Vec::new(),
        }
    }

    /// Rows seen, including the ones the reader rejected.
    pub fn len(&self) -> usize {
        self.records.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn decode_csv(filename: &str, bytes: &[u8], max_bytes: usize) -> Result<UploadBatch, UploadError> {
    if !filename.trim().to_ascii_lowercase().ends_with(".csv") {
        return Err(UploadError::UnsupportedFormat(filename.to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers().map_err(UploadError::Header)?.clone();
    if headers.is_empty() {
        return Err(UploadError::MissingHeader);
    }

    let mut decoded = UploadBatch::default();
    for (row, result) in reader.records().enumerate() {
        match result {
            Ok(row_values) => {
                let mut record = RawRecord::new(row);
                for (name, raw) in headers.iter().zip(row_values.iter()) {
                    if name.is_empty() {
                        continue;
                    }
                    record.insert(name, FieldValue::infer(raw));
                }
                decoded.records.push(record);
            }
            Err(err) => {
                tracing::debug!(row, error = %err, "unparseable upload row");
                decoded.rejected.push(RecordRejection {
                    record_id: format!("row-{row}"),
                    error: ValidationError::new("*", ValidationKind::Invalid, err.to_string()),
                });
            }
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "metric_name,timestamp,value,source_record_id\n\
heart_rate,2024-06-01T10:00:00Z,70,a\n\
heart_rate,2024-06-01T10:20:00Z,,b\n\
heart_rate,2024-06-01T10:40:00Z,71.5,c\n";

    #[test]
    fn decodes_rows_with_typed_cells() {
        let decoded = decode_csv("vitals.CSV", SAMPLE.as_bytes(), 1024).unwrap();
        assert_eq!(decoded.records.len(), 3);
        assert!(decoded.rejected.is_empty());
        assert_eq!(decoded.records[0].get("value"), Some(&FieldValue::Int(70)));
        assert_eq!(decoded.records[1].get("value"), Some(&FieldValue::Null));
        assert_eq!(decoded.records[2].get("value"), Some(&FieldValue::Float(71.5)));
        assert_eq!(decoded.records[2].row, 2);
    }

    #[test]
    fn rejects_non_csv_and_oversized_uploads() {
        assert!(matches!(
            decode_csv("vitals.txt", SAMPLE.as_bytes(), 1024),
            Err(UploadError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            decode_csv("vitals.csv", SAMPLE.as_bytes(), 10),
            Err(UploadError::TooLarge { limit: 10, .. })
        ));
    }

    #[test]
    fn ragged_rows_become_rejections() {
        let body = "metric_name,timestamp,value\nheart_rate,2024-06-01T10:00:00Z,70\nheart_rate,oops\n";
        let decoded = decode_csv("vitals.csv", body.as_bytes(), 1024).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.rejected.len(), 1);
        assert_eq!(decoded.rejected[0].record_id, "row-1");
        assert_eq!(decoded.rejected[0].error.kind, ValidationKind::Invalid);
    }
}
