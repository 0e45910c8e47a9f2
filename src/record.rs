use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// A primitive value as it arrived from the upload layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
        }
    }

    /// Infer a typed value from a raw text cell (CSV uploads arrive untyped).
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return FieldValue::Null;
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return FieldValue::Int(value);
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.is_finite() {
                return FieldValue::Float(value);
            }
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => FieldValue::Bool(true),
            "false" => FieldValue::Bool(false),
            _ => FieldValue::Text(trimmed.to_string()),
        }
    }

    fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => n.as_f64().map(FieldValue::Float).unwrap_or(FieldValue::Null),
            },
            JsonValue::String(s) => FieldValue::Text(s.clone()),
            // nested payloads are not primitives; keep the text so it can be
            // reported, the normalizer rejects it where a number is required
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// One uploaded record: field name to primitive value, plus its position in
/// the batch so rejections can be reported even when the record has no id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub row: usize,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new(row: usize) -> Self {
        Self {
            row,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: FieldValue) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }

    pub fn insert(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Non-null value for `field`, treating blank text as absent.
    pub fn present(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).filter(|value| !value.is_null())
    }

    /// Build a record from a JSON object. Returns `None` for anything that is
    /// not an object.
    pub fn from_json(row: usize, value: &JsonValue) -> Option<Self> {
        let object = value.as_object()?;
        let fields = object
            .iter()
            .map(|(name, value)| (name.clone(), FieldValue::from_json(value)))
            .collect();
        Some(Self { row, fields })
    }

    pub fn fallback_id(&self) -> String {
        format!("row-{}", self.row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infer_recognises_primitive_cells() {
        assert_eq!(FieldValue::infer(" 72 "), FieldValue::Int(72));
        assert_eq!(FieldValue::infer("71.5"), FieldValue::Float(71.5));
        assert_eq!(FieldValue::infer("TRUE"), FieldValue::Bool(true));
        assert_eq!(FieldValue::infer(""), FieldValue::Null);
        assert_eq!(FieldValue::infer("NaN"), FieldValue::Text("NaN".to_string()));
        assert_eq!(
            FieldValue::infer("2024-01-01T10:00:00Z"),
            FieldValue::Text("2024-01-01T10:00:00Z".to_string())
        );
    }

    #[test]
    fn from_json_keeps_primitives_and_flattens_nested_values() {
        let record = RawRecord::from_json(
            3,
            &json!({
                "metric_name": "heart_rate",
                "value": 70,
                "ratio": 0.5,
                "flag": false,
                "missing": null,
                "tags": ["a", "b"],
            }),
        )
        .unwrap();
        assert_eq!(record.row, 3);
        assert_eq!(record.get("value"), Some(&FieldValue::Int(70)));
        assert_eq!(record.get("ratio"), Some(&FieldValue::Float(0.5)));
        assert_eq!(record.get("flag"), Some(&FieldValue::Bool(false)));
        assert!(record.present("missing").is_none());
        assert_eq!(
            record.get("tags"),
            Some(&FieldValue::Text("[\"a\",\"b\"]".to_string()))
        );
        assert!(RawRecord::from_json(0, &json!([1, 2])).is_none());
    }
}
