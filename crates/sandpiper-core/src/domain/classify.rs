//! Shape-based classification of execution results.
//!
//! Classification looks only at the runtime shape of the value a program
//! produced; it is decided once here and never re-inspected downstream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::lang::Object;

/// Tag stored alongside an artifact's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Table,
    #[serde(rename = "key-value")]
    KeyValue,
    Scalar,
    Other,
    Absent,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Table => "table",
            ResultKind::KeyValue => "key-value",
            ResultKind::Scalar => "scalar",
            ResultKind::Other => "other",
            ResultKind::Absent => "absent",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "table" => ResultKind::Table,
            "key-value" => ResultKind::KeyValue,
            "scalar" => ResultKind::Scalar,
            "other" => ResultKind::Other,
            "absent" => ResultKind::Absent,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A produced value, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedResult {
    /// Non-empty sequence whose every element is a mapping. `columns` is the
    /// union of row keys in first-seen order.
    Table {
        columns: Vec<String>,
        rows: Vec<Map<String, Json>>,
    },
    KeyValue(Map<String, Json>),
    /// Number, string or boolean.
    Scalar(Json),
    Other(Json),
    Absent,
}

impl ClassifiedResult {
    pub fn classify(value: &Object) -> Self {
        match value {
            Object::None => ClassifiedResult::Absent,
            Object::Bool(_) | Object::Int(_) | Object::Float(_) | Object::Str(_) => {
                ClassifiedResult::Scalar(value.to_json())
            }
            Object::Dict(_) => match value.to_json() {
                Json::Object(map) => ClassifiedResult::KeyValue(map),
                other => ClassifiedResult::Other(other),
            },
            Object::List(items) | Object::Tuple(items)
                if !items.is_empty() && items.iter().all(|i| matches!(i, Object::Dict(_))) =>
            {
                let mut columns: Vec<String> = Vec::new();
                let mut rows = Vec::with_capacity(items.len());
                for item in items {
                    if let Json::Object(row) = item.to_json() {
                        for key in row.keys() {
                            if !columns.contains(key) {
                                columns.push(key.clone());
                            }
                        }
                        rows.push(row);
                    }
                }
                ClassifiedResult::Table { columns, rows }
            }
            other => ClassifiedResult::Other(other.to_json()),
        }
    }

    /// Rebuild from a stored `(kind, payload)` pair.
    pub fn from_stored(kind: ResultKind, payload: Option<&Json>) -> Self {
        match (kind, payload) {
            (ResultKind::Absent, _) | (_, None) => ClassifiedResult::Absent,
            (ResultKind::Table, Some(Json::Array(items))) => {
                let mut columns: Vec<String> = Vec::new();
                let rows: Vec<Map<String, Json>> = items
                    .iter()
                    .filter_map(|item| item.as_object().cloned())
                    .collect();
                for row in &rows {
                    for key in row.keys() {
                        if !columns.contains(key) {
                            columns.push(key.clone());
                        }
                    }
                }
                ClassifiedResult::Table { columns, rows }
            }
            (ResultKind::KeyValue, Some(Json::Object(map))) => ClassifiedResult::KeyValue(map.clone()),
            (ResultKind::Scalar, Some(value)) => ClassifiedResult::Scalar(value.clone()),
            (_, Some(value)) => ClassifiedResult::Other(value.clone()),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            ClassifiedResult::Table { .. } => ResultKind::Table,
            ClassifiedResult::KeyValue(_) => ResultKind::KeyValue,
            ClassifiedResult::Scalar(_) => ResultKind::Scalar,
            ClassifiedResult::Other(_) => ResultKind::Other,
            ClassifiedResult::Absent => ResultKind::Absent,
        }
    }

    /// JSON payload; `None` when absent.
    pub fn to_json(&self) -> Option<Json> {
        match self {
            ClassifiedResult::Table { rows, .. } => Some(Json::Array(
                rows.iter().cloned().map(Json::Object).collect(),
            )),
            ClassifiedResult::KeyValue(map) => Some(Json::Object(map.clone())),
            ClassifiedResult::Scalar(value) | ClassifiedResult::Other(value) => Some(value.clone()),
            ClassifiedResult::Absent => None,
        }
    }

    pub fn row_count(&self) -> Option<usize> {
        match self {
            ClassifiedResult::Table { rows, .. } => Some(rows.len()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Object)]) -> Object {
        Object::Dict(
            pairs
                .iter()
                .map(|(k, v)| (Object::str(*k), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_sequence_of_mappings_is_table() {
        let value = Object::List(vec![
            row(&[("a", Object::Int(1)), ("b", Object::Int(2))]),
            row(&[("a", Object::Int(3)), ("c", Object::None)]),
        ]);
        let result = ClassifiedResult::classify(&value);
        assert_eq!(result.kind(), ResultKind::Table);
        assert_eq!(result.row_count(), Some(2));
        match &result {
            ClassifiedResult::Table { columns, .. } => assert_eq!(columns, &["a", "b", "c"]),
            other => panic!("expected table, got {other:?}"),
        }
        assert_eq!(
            result.to_json().unwrap(),
            json!([{"a": 1, "b": 2}, {"a": 3, "c": null}])
        );
    }

    #[test]
    fn test_shapes() {
        let kv = row(&[("total", Object::Int(891))]);
        assert_eq!(ClassifiedResult::classify(&kv).kind(), ResultKind::KeyValue);
        assert_eq!(ClassifiedResult::classify(&Object::Int(42)).kind(), ResultKind::Scalar);
        assert_eq!(ClassifiedResult::classify(&Object::str("x")).kind(), ResultKind::Scalar);
        assert_eq!(ClassifiedResult::classify(&Object::Bool(true)).kind(), ResultKind::Scalar);
        assert_eq!(ClassifiedResult::classify(&Object::None).kind(), ResultKind::Absent);
        assert_eq!(
            ClassifiedResult::classify(&Object::List(vec![Object::Int(1), Object::Int(2)])).kind(),
            ResultKind::Other
        );
        assert_eq!(ClassifiedResult::classify(&Object::List(vec![])).kind(), ResultKind::Other);
        let mixed = Object::List(vec![kv.clone(), Object::Int(1)]);
        assert_eq!(ClassifiedResult::classify(&mixed).kind(), ResultKind::Other);
    }

    #[test]
    fn test_absent_has_no_payload() {
        assert_eq!(ClassifiedResult::Absent.to_json(), None);
        assert_eq!(ResultKind::parse("key-value"), Some(ResultKind::KeyValue));
        assert_eq!(ResultKind::KeyValue.to_string(), "key-value");
        assert_eq!(ResultKind::parse("grid"), None);
        assert_eq!(ResultKind::parse("key_value"), None);
        assert_eq!(
            serde_json::to_value(ResultKind::KeyValue).unwrap(),
            json!("key-value")
        );
    }

    #[test]
    fn test_from_stored_round_trip() {
        let value = Object::List(vec![row(&[("n", Object::Int(1))])]);
        let result = ClassifiedResult::classify(&value);
        let stored = result.to_json();
        assert_eq!(
            ClassifiedResult::from_stored(result.kind(), stored.as_ref()),
            result
        );
    }
}
