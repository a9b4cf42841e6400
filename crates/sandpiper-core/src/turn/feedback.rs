//! Text fed back to the model after tool requests.

use serde_json::Value as Json;

use crate::domain::{Artifact, ClassifiedResult};

/// Compact description of an execution: shape, never the full payload.
pub fn summarize(artifact: &Artifact) -> String {
    if let Some(error) = &artifact.error {
        return format!("Error: {error}");
    }
    let uid = &artifact.id;
    match &artifact.result {
        ClassifiedResult::Table { columns, rows } => format!(
            "Result UID: {uid}\nType: table\nRows: {}\nColumns: {}",
            rows.len(),
            columns.join(", ")
        ),
        ClassifiedResult::Scalar(value) => {
            format!("Result UID: {uid}\nType: scalar (displayed as a metric)\nValue: {value}")
        }
        ClassifiedResult::KeyValue(map) => format!(
            "Result UID: {uid}\nType: dict (displayed as key-value pairs)\nKeys: {}",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
        ClassifiedResult::Other(value) => {
            let data: String = value.to_string().chars().take(200).collect();
            format!("Result UID: {uid}\nType: other\nData: {data}")
        }
        ClassifiedResult::Absent => format!("Result UID: {uid}\nType: none\nValue: None"),
    }
}

/// An earlier artifact's data, rendered for the model: a markdown table of
/// at most `max_rows` rows, or pretty JSON for other shapes.
pub fn render_loaded(artifact: &Artifact, max_rows: usize) -> String {
    if let Some(error) = &artifact.error {
        return format!("Error in result: {error}");
    }
    match &artifact.result {
        ClassifiedResult::Absent => "Result: None".to_string(),
        ClassifiedResult::Table { columns, rows } => {
            let header = columns.join(" | ");
            let sep = vec!["---"; columns.len()].join(" | ");
            let body = rows
                .iter()
                .take(max_rows)
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c).map(cell_text).unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .collect::<Vec<_>>()
                .join("\n");
            let note = if rows.len() > max_rows {
                format!("\n\n(Showing {} of {} rows)", max_rows, rows.len())
            } else {
                String::new()
            };
            format!("{header}\n{sep}\n{body}{note}")
        }
        other => other
            .to_json()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| "Result: None".to_string()),
    }
}

/// Reply to a load request whose artifact does not exist.
pub fn missing_result(uid: &str) -> String {
    format!("Error: No result found for UID {uid}")
}

fn cell_text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => "None".to_string(),
        Json::Bool(true) => "True".to_string(),
        Json::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Object;

    fn table_artifact(n: usize) -> Artifact {
        let rows = (0..n)
            .map(|i| {
                Object::Dict(vec![
                    (Object::str("name"), Object::str(format!("p{i}"))),
                    (Object::str("age"), if i == 0 { Object::None } else { Object::Int(i as i64) }),
                ])
            })
            .collect();
        let mut artifact = Artifact::new("fetch('people')");
        artifact.result = ClassifiedResult::classify(&Object::List(rows));
        artifact
    }

    #[test]
    fn test_summarize_table() {
        let artifact = table_artifact(3);
        assert_eq!(
            summarize(&artifact),
            format!("Result UID: {}\nType: table\nRows: 3\nColumns: name, age", artifact.id)
        );
    }

    #[test]
    fn test_summarize_scalar_and_error() {
        let mut artifact = Artifact::new("42");
        artifact.result = ClassifiedResult::classify(&Object::Int(42));
        assert!(summarize(&artifact).ends_with("Type: scalar (displayed as a metric)\nValue: 42"));

        artifact.error = Some("Runtime error: boom".into());
        assert_eq!(summarize(&artifact), "Error: Runtime error: boom");
    }

    #[test]
    fn test_render_loaded_truncates() {
        let artifact = table_artifact(5);
        let text = render_loaded(&artifact, 2);
        assert_eq!(
            text,
            "name | age\n--- | ---\np0 | None\np1 | 1\n\n(Showing 2 of 5 rows)"
        );
    }

    #[test]
    fn test_render_loaded_other_shapes() {
        let mut artifact = Artifact::new("{'a': 1}");
        artifact.result = ClassifiedResult::classify(&Object::Dict(vec![(
            Object::str("a"),
            Object::Int(1),
        )]));
        assert_eq!(render_loaded(&artifact, 100), "{\n  \"a\": 1\n}");
        assert_eq!(render_loaded(&Artifact::new("None"), 100), "Result: None");
        assert_eq!(missing_result("x"), "Error: No result found for UID x");
    }
}
