//! Integration tests for dataset loading and the in-memory table store.

use sandpiper_state::loader;
use sandpiper_state::storage_traits::*;
use sandpiper_state::StorageError;

const PASSENGERS: &str = r#"[
    {"name": "Braund", "sex": "male", "age": 22, "survived": 0, "pclass": 3},
    {"name": "Cumings", "sex": "female", "age": 38, "survived": 1, "pclass": 1},
    {"name": "Heikkinen", "sex": "female", "age": 26, "survived": 1, "pclass": 3},
    {"name": "Moran", "sex": "male", "age": null, "survived": 0, "pclass": 3},
    {"name": "Allen", "sex": "male", "age": 35.5, "survived": 0, "pclass": 3}
]"#;

fn titanic() -> (tempfile::TempDir, sandpiper_state::MemoryTableStore) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("titanic.json"), PASSENGERS).unwrap();
    let store = loader::load_dir(dir.path()).unwrap();
    (dir, store)
}

#[tokio::test]
async fn describe_reports_inferred_types() {
    let (_dir, store) = titanic();
    let columns = store.describe("titanic").await.unwrap();
    let pairs: Vec<_> = columns
        .iter()
        .map(|c| (c.column_name.as_str(), c.column_type))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("name", ColumnType::Varchar),
            ("sex", ColumnType::Varchar),
            ("age", ColumnType::Double),
            ("survived", ColumnType::Bigint),
            ("pclass", ColumnType::Bigint),
        ]
    );
}

#[tokio::test]
async fn table_names_are_file_stems() {
    let (_dir, store) = titanic();
    assert_eq!(store.table_names().await.unwrap(), vec!["titanic".to_string()]);
}

#[tokio::test]
async fn count_is_a_conjunction_of_equalities() {
    let (_dir, store) = titanic();
    let filter = EqualityFilter::new()
        .with_term("sex", Cell::Text("male".into()))
        .with_term("pclass", Cell::Int(3));
    assert_eq!(store.count("titanic", &filter).await.unwrap(), 3);

    let filter = EqualityFilter::new().with_term("age", Cell::Null);
    assert_eq!(store.count("titanic", &filter).await.unwrap(), 1);
}

#[tokio::test]
async fn integer_filter_matches_widened_double_column() {
    let (_dir, store) = titanic();
    let filter = EqualityFilter::new().with_term("age", Cell::Int(22));
    assert_eq!(store.count("titanic", &filter).await.unwrap(), 1);
}

#[tokio::test]
async fn fetch_orders_projects_and_limits() {
    let (_dir, store) = titanic();
    let query = FetchQuery {
        table: "titanic".into(),
        columns: Some(vec!["name".into(), "age".into()]),
        filter: EqualityFilter::new().with_term("survived", Cell::Int(0)),
        order_by: Some(OrderBy {
            column: "age".into(),
            direction: SortDirection::Asc,
        }),
        limit: 2,
    };
    let rows = store.fetch(&query).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], ("name".to_string(), Cell::Text("Braund".into())));
    assert_eq!(rows[1][0], ("name".to_string(), Cell::Text("Allen".into())));
    assert_eq!(rows[1][1], ("age".to_string(), Cell::Float(35.5)));
}

#[tokio::test]
async fn fetch_unknown_column_is_rejected() {
    let (_dir, store) = titanic();
    let query = FetchQuery {
        table: "titanic".into(),
        columns: Some(vec!["fare".into()]),
        filter: EqualityFilter::new(),
        order_by: None,
        limit: 10,
    };
    let err = store.fetch(&query).await.unwrap_err();
    assert!(matches!(err, StorageError::ColumnNotFound { .. }));
}
