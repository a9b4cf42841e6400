//! External function dispatcher.
//!
//! Turns a paused program's call into a bounded store operation. Requests
//! are validated in two passes: syntactically from the call alone, then
//! against the table's schema. Only a request that survives both reaches
//! `count` or `fetch`.

use std::sync::Arc;
use std::time::Instant;

use sandpiper_state::{ColumnInfo, Row, StorageError, TableStore};
use tracing::instrument;

use super::error::ValidationFault;
use super::operation::Operation;
use super::policy::FetchPolicy;
use super::request::Request;
use crate::domain::{CallSummary, UpstreamFault};
use crate::lang::{ExternalCall, Object};
use crate::metrics::METRICS;
use crate::obs;

/// Outcome of one dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Value injected into the program on resume.
    pub value: Object,
    pub summary: CallSummary,
    /// Set when the call was refused; `value` then carries the error mapping.
    pub rejected: Option<ValidationFault>,
}

enum Failure {
    Rejected(ValidationFault),
    Upstream(UpstreamFault),
}

impl From<ValidationFault> for Failure {
    fn from(fault: ValidationFault) -> Self {
        Failure::Rejected(fault)
    }
}

pub struct Dispatcher {
    store: Arc<dyn TableStore>,
    policy: FetchPolicy,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn TableStore>, policy: FetchPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Serve one external call. Validation failures come back as values;
    /// only an unavailable store is an error.
    #[instrument(skip(self, call), fields(operation = %call.name))]
    pub async fn dispatch(&self, call: &ExternalCall) -> Result<Dispatched, UpstreamFault> {
        let started = Instant::now();
        METRICS.inc_external_calls();

        let served = match Request::from_call(call, &self.policy) {
            Ok(request) => self.serve(&request).await,
            Err(fault) => Err(Failure::Rejected(fault)),
        };

        let dispatched = match served {
            Ok(dispatched) => dispatched,
            Err(Failure::Upstream(fault)) => return Err(fault),
            Err(Failure::Rejected(fault)) => {
                METRICS.inc_validation_rejections();
                obs::emit_validation_rejected(&call.name, &fault.to_string());
                Dispatched {
                    value: fault.to_object(),
                    summary: CallSummary {
                        operation: call.name.clone(),
                        kind: "rejected".into(),
                        rows: None,
                        columns: Vec::new(),
                    },
                    rejected: Some(fault),
                }
            }
        };

        obs::emit_external_call(
            &dispatched.summary.operation,
            &dispatched.summary.kind,
            dispatched.summary.rows,
            started.elapsed().as_millis() as u64,
        );
        Ok(dispatched)
    }

    async fn serve(&self, request: &Request) -> Result<Dispatched, Failure> {
        let op = request.operation();
        let schema = match request.table() {
            Some(table) => Some(self.schema_of(table).await?),
            None => None,
        };
        if let (Some(table), Some(schema)) = (request.table(), &schema) {
            for column in request.referenced_columns() {
                if !schema.iter().any(|c| c.column_name == column) {
                    return Err(Failure::Rejected(ValidationFault::UnknownColumn {
                        table: table.to_string(),
                        column: column.to_string(),
                    }));
                }
            }
        }

        match request {
            Request::Tables => {
                let names = self.store.table_names().await.map_err(storage_failure)?;
                let rows = names.len() as u64;
                Ok(served(
                    op,
                    "tables",
                    Some(rows),
                    Vec::new(),
                    Object::List(names.into_iter().map(Object::Str).collect()),
                ))
            }
            Request::Describe { .. } => {
                let schema = schema.unwrap_or_default();
                let columns = schema.iter().map(|c| c.column_name.clone()).collect();
                let value = Object::List(schema.iter().map(column_object).collect());
                Ok(served(op, "schema", Some(schema.len() as u64), columns, value))
            }
            Request::Count { table, filter } => {
                let n = self.store.count(table, filter).await.map_err(storage_failure)?;
                Ok(served(
                    op,
                    "count",
                    Some(n),
                    Vec::new(),
                    Object::Int(i64::try_from(n).unwrap_or(i64::MAX)),
                ))
            }
            Request::Fetch(query) => {
                let rows = self.store.fetch(query).await.map_err(storage_failure)?;
                let columns = match &query.columns {
                    Some(columns) => columns.clone(),
                    None => schema
                        .unwrap_or_default()
                        .into_iter()
                        .map(|c| c.column_name)
                        .collect(),
                };
                let n = rows.len() as u64;
                let value = Object::List(rows.into_iter().map(row_object).collect());
                Ok(served(op, "rows", Some(n), columns, value))
            }
        }
    }

    async fn schema_of(&self, table: &str) -> Result<Vec<ColumnInfo>, Failure> {
        match self.store.describe(table).await {
            Ok(schema) => Ok(schema),
            Err(StorageError::TableNotFound { table }) => {
                let available = self.store.table_names().await.map_err(storage_failure)?;
                Err(Failure::Rejected(ValidationFault::UnknownTable { table, available }))
            }
            Err(err) => Err(storage_failure(err)),
        }
    }
}

fn storage_failure(err: StorageError) -> Failure {
    match err {
        StorageError::TableNotFound { table } => Failure::Rejected(ValidationFault::UnknownTable {
            table,
            available: Vec::new(),
        }),
        StorageError::ColumnNotFound { table, column } => {
            Failure::Rejected(ValidationFault::UnknownColumn { table, column })
        }
        other => Failure::Upstream(UpstreamFault::Store(other.to_string())),
    }
}

fn served(
    op: Operation,
    kind: &str,
    rows: Option<u64>,
    columns: Vec<String>,
    value: Object,
) -> Dispatched {
    Dispatched {
        value,
        summary: CallSummary {
            operation: op.name().to_string(),
            kind: kind.to_string(),
            rows,
            columns,
        },
        rejected: None,
    }
}

fn column_object(info: &ColumnInfo) -> Object {
    Object::Dict(vec![
        (Object::str("column_name"), Object::str(info.column_name.clone())),
        (Object::str("column_type"), Object::str(info.column_type.to_string())),
    ])
}

fn row_object(row: Row) -> Object {
    Object::Dict(
        row.into_iter()
            .map(|(column, cell)| (Object::Str(column), Object::from(&cell)))
            .collect(),
    )
}
