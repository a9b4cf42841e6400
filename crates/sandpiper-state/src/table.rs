//! In-memory columnar table store.
//!
//! Each [`Table`] keeps one `Vec<Cell>` per column. The store is built once
//! (typically by [`crate::loader`]) and then shared read-only behind an
//! `Arc`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{
    Cell, ColumnInfo, ColumnType, EqualityFilter, FetchQuery, Row, SortDirection, StorageResult,
    TableStore,
};

/// A single column: metadata plus values in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub info: ColumnInfo,
    pub values: Vec<Cell>,
}

/// A named table stored column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    /// Build a table from row-major data. Every row must have one cell per column.
    pub fn from_rows(
        name: impl Into<String>,
        schema: Vec<ColumnInfo>,
        rows: Vec<Vec<Cell>>,
    ) -> StorageResult<Self> {
        let name = name.into();
        let mut columns: Vec<Column> = schema
            .into_iter()
            .map(|info| Column {
                info,
                values: Vec::with_capacity(rows.len()),
            })
            .collect();

        let row_count = rows.len();
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(StorageError::DatasetLoad {
                    path: name.clone(),
                    reason: format!(
                        "row {i} has {} cells, expected {}",
                        row.len(),
                        columns.len()
                    ),
                });
            }
            for (column, cell) in columns.iter_mut().zip(row) {
                column.values.push(cell);
            }
        }

        Ok(Self {
            name,
            columns,
            row_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn schema(&self) -> Vec<ColumnInfo> {
        self.columns.iter().map(|c| c.info.clone()).collect()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.info.column_name == column)
    }

    fn require_column(&self, column: &str) -> StorageResult<usize> {
        self.column_index(column)
            .ok_or_else(|| StorageError::ColumnNotFound {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    /// Row indices satisfying every term of the filter.
    fn matching_rows(&self, filter: &EqualityFilter) -> StorageResult<Vec<usize>> {
        let terms = filter
            .terms
            .iter()
            .map(|(column, value)| self.require_column(column).map(|col| (col, value)))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok((0..self.row_count)
            .filter(|&row| {
                terms
                    .iter()
                    .all(|(col, value)| self.columns[*col].values[row].matches(value))
            })
            .collect())
    }
}

/// Total order used by `order_by`: numbers, then booleans, then text, nulls last.
fn compare_cells(a: &Cell, b: &Cell) -> Ordering {
    fn rank(cell: &Cell) -> u8 {
        match cell {
            Cell::Int(_) | Cell::Float(_) => 0,
            Cell::Bool(_) => 1,
            Cell::Text(_) => 2,
            Cell::Null => 3,
        }
    }

    match (a, b) {
        (Cell::Int(x), Cell::Int(y)) => x.cmp(y),
        (Cell::Int(x), Cell::Float(y)) => (*x as f64).total_cmp(y),
        (Cell::Float(x), Cell::Int(y)) => x.total_cmp(&(*y as f64)),
        (Cell::Float(x), Cell::Float(y)) => x.total_cmp(y),
        (Cell::Bool(x), Cell::Bool(y)) => x.cmp(y),
        (Cell::Text(x), Cell::Text(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Read-only in-memory columnar store.
#[derive(Debug, Default, Clone)]
pub struct MemoryTableStore {
    tables: BTreeMap<String, Table>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table.
    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Add a table and return `self` (builder pattern).
    pub fn with_table(mut self, table: Table) -> Self {
        self.insert(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn require_table(&self, name: &str) -> StorageResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::TableNotFound {
                table: name.to_string(),
            })
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn table_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn describe(&self, table: &str) -> StorageResult<Vec<ColumnInfo>> {
        Ok(self.require_table(table)?.schema())
    }

    async fn count(&self, table: &str, filter: &EqualityFilter) -> StorageResult<u64> {
        let table = self.require_table(table)?;
        Ok(table.matching_rows(filter)?.len() as u64)
    }

    async fn fetch(&self, query: &FetchQuery) -> StorageResult<Vec<Row>> {
        let table = self.require_table(&query.table)?;

        let projection: Vec<usize> = match &query.columns {
            Some(columns) => columns
                .iter()
                .map(|c| table.require_column(c))
                .collect::<StorageResult<_>>()?,
            None => (0..table.columns.len()).collect(),
        };

        let mut rows = table.matching_rows(&query.filter)?;

        if let Some(order) = &query.order_by {
            let col = &table.columns[table.require_column(&order.column)?].values;
            rows.sort_by(|&a, &b| {
                let ord = compare_cells(&col[a], &col[b]);
                match order.direction {
                    SortDirection::Asc => ord,
                    // Nulls stay last in both directions.
                    SortDirection::Desc => match (col[a].is_null(), col[b].is_null()) {
                        (false, false) => ord.reverse(),
                        _ => ord,
                    },
                }
            });
        }

        rows.truncate(query.limit);
        debug!(table = %query.table, rows = rows.len(), "fetch served");

        Ok(rows
            .into_iter()
            .map(|row| {
                projection
                    .iter()
                    .map(|&col| {
                        let column = &table.columns[col];
                        (column.info.column_name.clone(), column.values[row].clone())
                    })
                    .collect()
            })
            .collect())
    }
}

/// Infer the declared type of a column from its values.
///
/// Integers widen to `DOUBLE` when any float is present; any text makes the
/// column `VARCHAR`; an all-null column is `VARCHAR`.
pub fn infer_column_type(values: &[Cell]) -> ColumnType {
    let mut ty: Option<ColumnType> = None;
    for cell in values {
        let cell_ty = match cell {
            Cell::Null => continue,
            Cell::Bool(_) => ColumnType::Boolean,
            Cell::Int(_) => ColumnType::Bigint,
            Cell::Float(_) => ColumnType::Double,
            Cell::Text(_) => ColumnType::Varchar,
        };
        ty = Some(match (ty, cell_ty) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Bigint), ColumnType::Double)
            | (Some(ColumnType::Double), ColumnType::Bigint) => ColumnType::Double,
            _ => ColumnType::Varchar,
        });
    }
    ty.unwrap_or(ColumnType::Varchar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::OrderBy;

    fn people() -> MemoryTableStore {
        let schema = vec![
            ColumnInfo {
                column_name: "id".into(),
                column_type: ColumnType::Bigint,
            },
            ColumnInfo {
                column_name: "name".into(),
                column_type: ColumnType::Varchar,
            },
            ColumnInfo {
                column_name: "age".into(),
                column_type: ColumnType::Double,
            },
        ];
        let rows = vec![
            vec![Cell::Int(1), Cell::Text("a".into()), Cell::Float(30.0)],
            vec![Cell::Int(2), Cell::Text("b".into()), Cell::Null],
            vec![Cell::Int(3), Cell::Text("c".into()), Cell::Float(12.5)],
        ];
        MemoryTableStore::new().with_table(Table::from_rows("people", schema, rows).unwrap())
    }

    fn query(limit: usize) -> FetchQuery {
        FetchQuery {
            table: "people".into(),
            columns: None,
            filter: EqualityFilter::new(),
            order_by: None,
            limit,
        }
    }

    #[tokio::test]
    async fn test_count_with_filter() {
        let store = people();
        let all = store.count("people", &EqualityFilter::new()).await.unwrap();
        assert_eq!(all, 3);

        let f = EqualityFilter::new().with_term("name", Cell::Text("b".into()));
        assert_eq!(store.count("people", &f).await.unwrap(), 1);

        let nulls = EqualityFilter::new().with_term("age", Cell::Null);
        assert_eq!(store.count("people", &nulls).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_projection_and_limit() {
        let store = people();
        let mut q = query(2);
        q.columns = Some(vec!["name".into()]);
        let rows = store.fetch(&q).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![("name".to_string(), Cell::Text("a".into()))]);
    }

    #[tokio::test]
    async fn test_fetch_order_desc_keeps_nulls_last() {
        let store = people();
        let mut q = query(10);
        q.order_by = Some(OrderBy {
            column: "age".into(),
            direction: SortDirection::Desc,
        });
        let rows = store.fetch(&q).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r[0].1.clone()).collect();
        assert_eq!(ids, vec![Cell::Int(1), Cell::Int(3), Cell::Int(2)]);
    }

    #[tokio::test]
    async fn test_unknown_table_and_column() {
        let store = people();
        let err = store.describe("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::TableNotFound { .. }));

        let f = EqualityFilter::new().with_term("zzz", Cell::Int(1));
        let err = store.count("people", &f).await.unwrap_err();
        assert!(matches!(err, StorageError::ColumnNotFound { .. }));
    }

    #[test]
    fn test_from_rows_rejects_ragged_rows() {
        let schema = vec![ColumnInfo {
            column_name: "x".into(),
            column_type: ColumnType::Bigint,
        }];
        let err = Table::from_rows("t", schema, vec![vec![Cell::Int(1), Cell::Int(2)]]);
        assert!(err.is_err());
    }

    #[test]
    fn test_infer_column_type() {
        assert_eq!(
            infer_column_type(&[Cell::Int(1), Cell::Float(2.0)]),
            ColumnType::Double
        );
        assert_eq!(
            infer_column_type(&[Cell::Null, Cell::Bool(true)]),
            ColumnType::Boolean
        );
        assert_eq!(
            infer_column_type(&[Cell::Int(1), Cell::Text("x".into())]),
            ColumnType::Varchar
        );
        assert_eq!(infer_column_type(&[Cell::Null]), ColumnType::Varchar);
    }
}
