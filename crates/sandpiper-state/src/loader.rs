//! Dataset loading into a [`MemoryTableStore`].
//!
//! Accepted inputs:
//! - `*.json`: a top-level array of objects
//! - `*.ndjson` / `*.jsonl`: one object per line
//!
//! The table name is the file stem. Column order follows first appearance of
//! each key; rows missing a key get `NULL`. Nested arrays or objects are kept
//! as their JSON text.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage_traits::{Cell, ColumnInfo, ColumnType, StorageResult};
use crate::table::{infer_column_type, MemoryTableStore, Table};

/// Build a table from a list of JSON objects.
pub fn table_from_objects(name: &str, objects: Vec<Map<String, Value>>) -> StorageResult<Table> {
    let mut column_names: Vec<String> = Vec::new();
    for object in &objects {
        for key in object.keys() {
            if !column_names.iter().any(|c| c == key) {
                column_names.push(key.clone());
            }
        }
    }

    let mut columns: Vec<Vec<Cell>> = vec![Vec::with_capacity(objects.len()); column_names.len()];
    for mut object in objects {
        for (i, column) in column_names.iter().enumerate() {
            let cell = object.remove(column).map(json_to_cell).unwrap_or(Cell::Null);
            columns[i].push(cell);
        }
    }

    let schema: Vec<ColumnInfo> = column_names
        .into_iter()
        .zip(columns.iter_mut())
        .map(|(column_name, values)| {
            let column_type = infer_column_type(values);
            coerce_column(values, column_type);
            ColumnInfo {
                column_name,
                column_type,
            }
        })
        .collect();

    // Back to row-major for Table::from_rows.
    let row_count = columns.first().map(Vec::len).unwrap_or(0);
    let mut rows: Vec<Vec<Cell>> = (0..row_count)
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, cell) in rows.iter_mut().zip(column) {
            row.push(cell);
        }
    }

    Table::from_rows(name, schema, rows)
}

fn json_to_cell(value: Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Cell::Int(i),
            None => Cell::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Cell::Text(s),
        nested @ (Value::Array(_) | Value::Object(_)) => Cell::Text(nested.to_string()),
    }
}

/// Make every non-null cell agree with the inferred column type.
fn coerce_column(values: &mut [Cell], column_type: ColumnType) {
    for cell in values.iter_mut() {
        let coerced = match (column_type, &*cell) {
            (ColumnType::Double, Cell::Int(i)) => Cell::Float(*i as f64),
            (ColumnType::Varchar, Cell::Int(i)) => Cell::Text(i.to_string()),
            (ColumnType::Varchar, Cell::Float(f)) => Cell::Text(f.to_string()),
            (ColumnType::Varchar, Cell::Bool(b)) => Cell::Text(b.to_string()),
            _ => continue,
        };
        *cell = coerced;
    }
}

/// Parse a single dataset file into a table named after its stem.
pub fn load_file(path: &Path) -> StorageResult<Table> {
    let load_err = |reason: String| StorageError::DatasetLoad {
        path: path.display().to_string(),
        reason,
    };

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| load_err("file name is not valid UTF-8".into()))?;
    let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;

    let objects = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let value: Value = serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?;
            match value {
                Value::Array(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        Value::Object(map) => Ok(map),
                        _ => Err(load_err(format!("element {i} is not an object"))),
                    })
                    .collect::<StorageResult<Vec<_>>>()?,
                _ => return Err(load_err("expected a top-level array".into())),
            }
        }
        Some("ndjson") | Some("jsonl") => text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(load_err(format!("line {} is not an object", i + 1))),
                Err(e) => Err(load_err(format!("line {}: {e}", i + 1))),
            })
            .collect::<StorageResult<Vec<_>>>()?,
        other => {
            return Err(load_err(format!(
                "unsupported extension: {}",
                other.unwrap_or("<none>")
            )))
        }
    };

    let table = table_from_objects(name, objects)?;
    debug!(table = name, rows = table.row_count(), "dataset loaded");
    Ok(table)
}

fn is_dataset_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "ndjson" | "jsonl")
    )
}

/// Load every dataset file in a directory (non-recursive).
///
/// Files with other extensions are skipped with a warning.
pub fn load_dir(dir: &Path) -> StorageResult<MemoryTableStore> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::DatasetLoad {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::DatasetLoad {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if is_dataset_file(&path) {
            paths.push(path);
        } else {
            warn!(path = %path.display(), "skipping non-dataset file");
        }
    }
    paths.sort();

    let mut store = MemoryTableStore::new();
    for path in paths {
        store.insert(load_file(&path)?);
    }
    info!(dir = %dir.display(), tables = store.len(), "datasets loaded");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn objects(v: Value) -> Vec<Map<String, Value>> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|o| o.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_column_order_and_missing_keys() {
        let table = table_from_objects(
            "t",
            objects(json!([{"a": 1, "b": "x"}, {"b": "y", "c": true}])),
        )
        .unwrap();
        let names: Vec<_> = table.schema().into_iter().map(|c| c.column_name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(table.row_count(), 2);
    }

    #[test]
    fn test_int_widens_to_double() {
        let table = table_from_objects("t", objects(json!([{"x": 1}, {"x": 2.5}]))).unwrap();
        assert_eq!(table.schema()[0].column_type, ColumnType::Double);
    }

    #[test]
    fn test_load_file_rejects_non_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"a": 1}"#).unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(matches!(err, StorageError::DatasetLoad { .. }));
    }

    #[test]
    fn test_load_dir_reads_json_and_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"[{"x": 1}, {"x": 2}]"#).unwrap();
        std::fs::write(dir.path().join("b.ndjson"), "{\"y\": \"p\"}\n\n{\"y\": \"q\"}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = load_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.table("b").unwrap().row_count(), 2);
    }
}
