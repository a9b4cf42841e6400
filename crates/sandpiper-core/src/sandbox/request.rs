//! Argument binding and syntactic validation of external calls.
//!
//! Everything here is decided from the call alone; table and column
//! existence is checked by the dispatcher against the store's schema.

use std::sync::OnceLock;

use regex::Regex;
use sandpiper_state::{Cell, EqualityFilter, FetchQuery, OrderBy, SortDirection};

use super::error::ValidationFault;
use super::operation::{Operation, TABLE_ALIAS};
use super::policy::FetchPolicy;
use crate::lang::{ExternalCall, Object};

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("identifier pattern"))
}

fn order_by_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*([a-zA-Z_][a-zA-Z0-9_]*)(?:\s+(ASC|DESC))?\s*$").expect("order_by pattern")
    })
}

/// A syntactically valid request for one of the bounded operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Tables,
    Describe { table: String },
    Count { table: String, filter: EqualityFilter },
    Fetch(FetchQuery),
}

impl Request {
    pub fn from_call(call: &ExternalCall, policy: &FetchPolicy) -> Result<Self, ValidationFault> {
        let op = Operation::parse(&call.name)
            .ok_or_else(|| ValidationFault::UnknownOperation(call.name.clone()))?;
        let args = bind(op, call)?;

        match op {
            Operation::Tables => Ok(Request::Tables),
            Operation::Describe => Ok(Request::Describe {
                table: table_arg(op, args[0].as_ref())?,
            }),
            Operation::Count => Ok(Request::Count {
                table: table_arg(op, args[0].as_ref())?,
                filter: filter_arg(args[1].as_ref())?,
            }),
            Operation::Fetch => {
                let table = table_arg(op, args[0].as_ref())?;
                let columns = columns_arg(args[1].as_ref())?;
                let filter = filter_arg(args[2].as_ref())?;
                let order_by = order_by_arg(args[3].as_ref())?;
                let limit = policy.resolve_limit(limit_arg(args[4].as_ref())?)?;
                Ok(Request::Fetch(FetchQuery {
                    table,
                    columns,
                    filter,
                    order_by,
                    limit,
                }))
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Request::Tables => Operation::Tables,
            Request::Describe { .. } => Operation::Describe,
            Request::Count { .. } => Operation::Count,
            Request::Fetch(_) => Operation::Fetch,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Request::Tables => None,
            Request::Describe { table } | Request::Count { table, .. } => Some(table.as_str()),
            Request::Fetch(query) => Some(query.table.as_str()),
        }
    }

    /// Every column the request names: projection, filter and ordering.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let filter = match self {
            Request::Count { filter, .. } => Some(filter),
            Request::Fetch(query) => Some(&query.filter),
            _ => None,
        };
        if let Request::Fetch(query) = self {
            if let Some(columns) = &query.columns {
                out.extend(columns.iter().map(String::as_str));
            }
        }
        if let Some(filter) = filter {
            out.extend(filter.terms.iter().map(|(c, _)| c.as_str()));
        }
        if let Request::Fetch(FetchQuery {
            order_by: Some(order),
            ..
        }) = self
        {
            out.push(order.column.as_str());
        }
        out
    }
}

/// Map positional and keyword arguments onto the operation's parameter slots.
fn bind(op: Operation, call: &ExternalCall) -> Result<Vec<Option<Object>>, ValidationFault> {
    let params = op.params();
    if call.args.len() > params.len() {
        return Err(ValidationFault::TooManyArguments {
            operation: op.name().into(),
            max: params.len(),
            given: call.args.len(),
        });
    }

    let mut slots: Vec<Option<Object>> = vec![None; params.len()];
    for (slot, arg) in slots.iter_mut().zip(&call.args) {
        *slot = Some(arg.clone());
    }

    for (name, value) in &call.kwargs {
        let key = if name == TABLE_ALIAS { "table" } else { name.as_str() };
        let idx = params.iter().position(|p| *p == key).ok_or_else(|| {
            ValidationFault::UnexpectedArgument {
                operation: op.name().into(),
                param: name.clone(),
            }
        })?;
        if slots[idx].is_some() {
            return Err(ValidationFault::DuplicateArgument {
                operation: op.name().into(),
                param: key.into(),
            });
        }
        slots[idx] = Some(value.clone());
    }

    Ok(slots)
}

fn identifier(name: &str) -> Result<String, ValidationFault> {
    if identifier_re().is_match(name) {
        Ok(name.to_string())
    } else {
        Err(ValidationFault::InvalidIdentifier(name.to_string()))
    }
}

fn table_arg(op: Operation, value: Option<&Object>) -> Result<String, ValidationFault> {
    match value {
        None | Some(Object::None) => Err(ValidationFault::MissingArgument {
            operation: op.name().into(),
            param: "table".into(),
        }),
        Some(Object::Str(name)) => identifier(name),
        Some(other) => Err(invalid("table", format!("expected str, got {}", other.type_name()))),
    }
}

fn columns_arg(value: Option<&Object>) -> Result<Option<Vec<String>>, ValidationFault> {
    match value {
        None | Some(Object::None) => Ok(None),
        Some(Object::Str(name)) => Ok(Some(vec![identifier(name)?])),
        Some(Object::List(items)) | Some(Object::Tuple(items)) => {
            if items.is_empty() {
                return Err(invalid("columns", "expected at least one column"));
            }
            items
                .iter()
                .map(|item| match item {
                    Object::Str(name) => identifier(name),
                    other => Err(invalid(
                        "columns",
                        format!("column names must be str, got {}", other.type_name()),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some)
        }
        Some(other) => Err(invalid(
            "columns",
            format!("expected a list of column names, got {}", other.type_name()),
        )),
    }
}

fn filter_arg(value: Option<&Object>) -> Result<EqualityFilter, ValidationFault> {
    let entries = match value {
        None | Some(Object::None) => return Ok(EqualityFilter::new()),
        Some(Object::Dict(entries)) => entries,
        Some(other) => {
            return Err(invalid(
                "where",
                format!("expected a dict of column -> value, got {}", other.type_name()),
            ))
        }
    };

    let mut filter = EqualityFilter::new();
    for (key, value) in entries {
        let column = match key {
            Object::Str(name) => identifier(name)?,
            other => {
                return Err(invalid(
                    "where",
                    format!("column names must be str, got {}", other.type_name()),
                ))
            }
        };
        let cell = match value {
            Object::None => Cell::Null,
            Object::Bool(b) => Cell::Bool(*b),
            Object::Int(i) => Cell::Int(*i),
            Object::Float(f) => Cell::Float(*f),
            Object::Str(s) => Cell::Text(s.clone()),
            Object::Dict(_) => {
                return Err(ValidationFault::NonEqualityFilter {
                    column,
                    found: "comparison mapping".into(),
                })
            }
            Object::List(_) | Object::Tuple(_) | Object::Set(_) => {
                return Err(ValidationFault::NonEqualityFilter {
                    column,
                    found: "list of alternatives".into(),
                })
            }
            other => {
                return Err(invalid(
                    "where",
                    format!("unsupported filter value of type {}", other.type_name()),
                ))
            }
        };
        filter = filter.with_term(column, cell);
    }
    Ok(filter)
}

fn order_by_arg(value: Option<&Object>) -> Result<Option<OrderBy>, ValidationFault> {
    let text = match value {
        None | Some(Object::None) => return Ok(None),
        Some(Object::Str(text)) => text,
        Some(other) => {
            return Err(invalid(
                "order_by",
                format!("expected str, got {}", other.type_name()),
            ))
        }
    };
    let caps = order_by_re()
        .captures(text)
        .ok_or_else(|| ValidationFault::InvalidOrderBy(text.clone()))?;
    let direction = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        Some(dir) if dir == "DESC" => SortDirection::Desc,
        _ => SortDirection::Asc,
    };
    Ok(Some(OrderBy {
        column: caps[1].to_string(),
        direction,
    }))
}

fn limit_arg(value: Option<&Object>) -> Result<Option<i64>, ValidationFault> {
    match value {
        None | Some(Object::None) => Ok(None),
        Some(Object::Int(n)) => Ok(Some(*n)),
        Some(other) => Err(invalid(
            "limit",
            format!("expected int, got {}", other.type_name()),
        )),
    }
}

fn invalid(param: &str, reason: impl Into<String>) -> ValidationFault {
    ValidationFault::InvalidArgument {
        param: param.into(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Object>, kwargs: Vec<(&str, Object)>) -> ExternalCall {
        ExternalCall {
            name: name.into(),
            args,
            kwargs: kwargs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    fn dict(pairs: Vec<(&str, Object)>) -> Object {
        Object::Dict(pairs.into_iter().map(|(k, v)| (Object::str(k), v)).collect())
    }

    #[test]
    fn test_positional_and_keyword_forms_agree() {
        let policy = FetchPolicy::new(100);
        let positional = call(
            "fetch",
            vec![
                Object::str("titanic"),
                Object::List(vec![Object::str("age")]),
                dict(vec![("survived", Object::Int(1))]),
                Object::str("age desc"),
                Object::Int(5),
            ],
            vec![],
        );
        let keyword = call(
            "fetch",
            vec![],
            vec![
                ("table_name", Object::str("titanic")),
                ("columns", Object::List(vec![Object::str("age")])),
                ("where", dict(vec![("survived", Object::Int(1))])),
                ("order_by", Object::str("age DESC")),
                ("limit", Object::Int(5)),
            ],
        );
        let a = Request::from_call(&positional, &policy).unwrap();
        let b = Request::from_call(&keyword, &policy).unwrap();
        assert_eq!(a, b);
        let Request::Fetch(query) = a else { panic!("expected fetch") };
        assert_eq!(query.limit, 5);
        assert_eq!(
            query.order_by,
            Some(OrderBy {
                column: "age".into(),
                direction: SortDirection::Desc
            })
        );
    }

    #[test]
    fn test_comparator_filter_rejected() {
        let c = call(
            "count",
            vec![Object::str("titanic")],
            vec![("where", dict(vec![("age", dict(vec![(">", Object::Int(10))]))]))],
        );
        assert!(matches!(
            Request::from_call(&c, &FetchPolicy::default()),
            Err(ValidationFault::NonEqualityFilter { column, .. }) if column == "age"
        ));
    }

    #[test]
    fn test_disjunction_filter_rejected() {
        let c = call(
            "count",
            vec![
                Object::str("pokemon"),
                dict(vec![("type1", Object::List(vec![Object::str("fire"), Object::str("water")]))]),
            ],
            vec![],
        );
        assert!(matches!(
            Request::from_call(&c, &FetchPolicy::default()),
            Err(ValidationFault::NonEqualityFilter { .. })
        ));
    }

    #[test]
    fn test_null_filter_value_means_is_null() {
        let c = call(
            "count",
            vec![Object::str("titanic"), dict(vec![("age", Object::None)])],
            vec![],
        );
        let Request::Count { filter, .. } = Request::from_call(&c, &FetchPolicy::default()).unwrap()
        else {
            panic!("expected count")
        };
        assert_eq!(filter.terms, vec![("age".to_string(), Cell::Null)]);
    }

    #[test]
    fn test_binding_errors() {
        let policy = FetchPolicy::default();
        let missing = call("describe", vec![], vec![]);
        assert!(matches!(
            Request::from_call(&missing, &policy),
            Err(ValidationFault::MissingArgument { .. })
        ));

        let dup = call("describe", vec![Object::str("a")], vec![("table", Object::str("b"))]);
        assert!(matches!(
            Request::from_call(&dup, &policy),
            Err(ValidationFault::DuplicateArgument { .. })
        ));

        let extra = call("tables", vec![Object::Int(1)], vec![]);
        assert!(matches!(
            Request::from_call(&extra, &policy),
            Err(ValidationFault::TooManyArguments { max: 0, given: 1, .. })
        ));

        let unknown = call("count", vec![Object::str("t")], vec![("filter", Object::None)]);
        assert!(matches!(
            Request::from_call(&unknown, &policy),
            Err(ValidationFault::UnexpectedArgument { .. })
        ));
    }

    #[test]
    fn test_identifiers_validated() {
        let policy = FetchPolicy::default();
        let c = call("describe", vec![Object::str("titanic; drop")], vec![]);
        assert_eq!(
            Request::from_call(&c, &policy),
            Err(ValidationFault::InvalidIdentifier("titanic; drop".into()))
        );
        let c = call(
            "fetch",
            vec![Object::str("t")],
            vec![("order_by", Object::str("age sideways"))],
        );
        assert!(matches!(
            Request::from_call(&c, &policy),
            Err(ValidationFault::InvalidOrderBy(_))
        ));
    }

    #[test]
    fn test_missing_limit_is_capped() {
        let c = call("fetch", vec![Object::str("t")], vec![]);
        let Request::Fetch(query) = Request::from_call(&c, &FetchPolicy::new(250)).unwrap() else {
            panic!("expected fetch")
        };
        assert_eq!(query.limit, 250);
        assert_eq!(query.columns, None);

        let c = call("fetch", vec![Object::str("t")], vec![("limit", Object::Int(0))]);
        assert!(matches!(
            Request::from_call(&c, &FetchPolicy::new(250)),
            Err(ValidationFault::LimitOutOfRange { given: 0, max: 250 })
        ));
    }

    #[test]
    fn test_referenced_columns() {
        let c = call(
            "fetch",
            vec![Object::str("t"), Object::str("a")],
            vec![
                ("where", dict(vec![("b", Object::Int(1))])),
                ("order_by", Object::str("c")),
            ],
        );
        let req = Request::from_call(&c, &FetchPolicy::default()).unwrap();
        assert_eq!(req.referenced_columns(), vec!["a", "b", "c"]);
        assert_eq!(req.table(), Some("t"));
        assert_eq!(req.operation(), Operation::Fetch);
    }
}
