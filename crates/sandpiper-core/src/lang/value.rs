//! Runtime values of the interpreter and the owned [`Object`] tree exchanged
//! with the host.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type ObjId = u32;

/// A value on the operand stack. Mutable containers and functions live on
/// the heap and are referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
    Ref(ObjId),
    Builtin(Builtin),
    /// Host function; calling it pauses execution.
    External(String),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }
}

/// Built-in functions and the type objects used by `type()` / `isinstance()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    Len,
    Sum,
    Min,
    Max,
    Sorted,
    Reversed,
    Range,
    Enumerate,
    Zip,
    Map,
    Filter,
    Round,
    Abs,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Tuple,
    Set,
    Type,
    Isinstance,
    Print,
    Any,
    All,
    Repr,
    NoneType,
    FunctionType,
    IteratorType,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Builtin::Len,
            "sum" => Builtin::Sum,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sorted" => Builtin::Sorted,
            "reversed" => Builtin::Reversed,
            "range" => Builtin::Range,
            "enumerate" => Builtin::Enumerate,
            "zip" => Builtin::Zip,
            "map" => Builtin::Map,
            "filter" => Builtin::Filter,
            "round" => Builtin::Round,
            "abs" => Builtin::Abs,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "list" => Builtin::List,
            "dict" => Builtin::Dict,
            "tuple" => Builtin::Tuple,
            "set" => Builtin::Set,
            "type" => Builtin::Type,
            "isinstance" => Builtin::Isinstance,
            "print" => Builtin::Print,
            "any" => Builtin::Any,
            "all" => Builtin::All,
            "repr" => Builtin::Repr,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Sum => "sum",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sorted => "sorted",
            Builtin::Reversed => "reversed",
            Builtin::Range => "range",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Map => "map",
            Builtin::Filter => "filter",
            Builtin::Round => "round",
            Builtin::Abs => "abs",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Tuple => "tuple",
            Builtin::Set => "set",
            Builtin::Type => "type",
            Builtin::Isinstance => "isinstance",
            Builtin::Print => "print",
            Builtin::Any => "any",
            Builtin::All => "all",
            Builtin::Repr => "repr",
            Builtin::NoneType => "NoneType",
            Builtin::FunctionType => "function",
            Builtin::IteratorType => "iterator",
        }
    }

    /// Builtins that double as type objects.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Builtin::Str
                | Builtin::Int
                | Builtin::Float
                | Builtin::Bool
                | Builtin::List
                | Builtin::Dict
                | Builtin::Tuple
                | Builtin::Set
                | Builtin::NoneType
                | Builtin::FunctionType
                | Builtin::IteratorType
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub code: u32,
    pub defaults: Vec<Value>,
    /// `None` until bound; reading an unbound capture is a NameError.
    pub captures: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IterState {
    Seq { items: Vec<Value>, pos: usize },
    Range { next: i64, stop: i64, step: i64 },
}

impl IterState {
    pub fn remaining(&self) -> usize {
        match self {
            IterState::Seq { items, pos } => items.len().saturating_sub(*pos),
            IterState::Range { next, stop, step } => range_len(*next, *stop, *step),
        }
    }
}

pub fn range_len(start: i64, stop: i64, step: i64) -> usize {
    let (lo, hi, step) = if step > 0 {
        (start as i128, stop as i128, step as i128)
    } else {
        (stop as i128, start as i128, -(step as i128))
    };
    if hi <= lo || step == 0 {
        0
    } else {
        ((hi - lo + step - 1) / step) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeapObject {
    List(Vec<Value>),
    Dict(#[serde(with = "dict_entries")] IndexMap<Key, (Value, Value)>),
    Set(#[serde(with = "set_entries")] IndexMap<Key, Value>),
    Function(Function),
    Iterator(IterState),
}

impl HeapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::List(_) => "list",
            HeapObject::Dict(_) => "dict",
            HeapObject::Set(_) => "set",
            HeapObject::Function(_) => "function",
            HeapObject::Iterator(_) => "iterator",
        }
    }
}

/// Hashable projection of a value used for dict keys and set members.
/// Booleans and integral floats collapse onto integers so `1`, `1.0` and
/// `True` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Int(i64),
    Float(u64),
    Str(String),
    Tuple(Vec<Key>),
    Builtin(Builtin),
}

impl Key {
    /// `None` when the value is unhashable.
    pub fn of(value: &Value) -> Option<Key> {
        Some(match value {
            Value::None => Key::None,
            Value::Bool(b) => Key::Int(*b as i64),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Key::Int(*f as i64)
                } else {
                    Key::Float(f.to_bits())
                }
            }
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(items.iter().map(Key::of).collect::<Option<_>>()?),
            Value::Builtin(b) => Key::Builtin(*b),
            Value::Ref(_) | Value::External(_) | Value::Slice { .. } => return None,
        })
    }
}

/// Entries are stored as a list of `(key value, value)` pairs since JSON
/// object keys must be strings.
mod dict_entries {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &IndexMap<Key, (Value, Value)>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<IndexMap<Key, (Value, Value)>, D::Error> {
        let entries = Vec::<(Value, Value)>::deserialize(deserializer)?;
        entries
            .into_iter()
            .map(|(k, v)| {
                let key = Key::of(&k).ok_or_else(|| <D::Error as serde::de::Error>::custom("unhashable key"))?;
                Ok((key, (k, v)))
            })
            .collect()
    }
}

mod set_entries {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        set: &IndexMap<Key, Value>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(set.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<IndexMap<Key, Value>, D::Error> {
        let items = Vec::<Value>::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|v| {
                let key = Key::of(&v).ok_or_else(|| <D::Error as serde::de::Error>::custom("unhashable member"))?;
                Ok((key, v))
            })
            .collect()
    }
}

/// Owned, heap-free value passed across the sandbox boundary: arguments
/// of external calls, values injected on resume and final results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    Set(Vec<Object>),
    /// Values with no data representation (functions, iterators).
    Repr(String),
}

impl Object {
    pub fn str(s: impl Into<String>) -> Self {
        Object::Str(s.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Object::None)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::None => "NoneType",
            Object::Bool(_) => "bool",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Str(_) => "str",
            Object::List(_) => "list",
            Object::Tuple(_) => "tuple",
            Object::Dict(_) => "dict",
            Object::Set(_) => "set",
            Object::Repr(_) => "object",
        }
    }

    /// Look up a string key of a dict.
    pub fn get(&self, key: &str) -> Option<&Object> {
        match self {
            Object::Dict(entries) => entries
                .iter()
                .find(|(k, _)| matches!(k, Object::Str(s) if s == key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Object::None,
            serde_json::Value::Bool(b) => Object::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Object::Int(i),
                None => Object::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Object::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Object::List(items.iter().map(Object::from_json).collect())
            }
            serde_json::Value::Object(map) => Object::Dict(
                map.iter()
                    .map(|(k, v)| (Object::Str(k.clone()), Object::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering of a result. Tuples and sets become arrays, non-string
    /// dict keys are stringified, non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Object::None => J::Null,
            Object::Bool(b) => J::Bool(*b),
            Object::Int(i) => J::from(*i),
            Object::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            Object::Str(s) | Object::Repr(s) => J::String(s.clone()),
            Object::List(items) | Object::Tuple(items) | Object::Set(items) => {
                J::Array(items.iter().map(Object::to_json).collect())
            }
            Object::Dict(entries) => J::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.key_text(), v.to_json()))
                    .collect(),
            ),
        }
    }

    fn key_text(&self) -> String {
        match self {
            Object::Str(s) | Object::Repr(s) => s.clone(),
            Object::None => "null".into(),
            Object::Bool(b) => b.to_string(),
            Object::Int(i) => i.to_string(),
            Object::Float(f) => super::format::float_repr(*f),
            other => other.to_json().to_string(),
        }
    }
}

impl From<&sandpiper_state::Cell> for Object {
    fn from(cell: &sandpiper_state::Cell) -> Self {
        use sandpiper_state::Cell;
        match cell {
            Cell::Null => Object::None,
            Cell::Bool(b) => Object::Bool(*b),
            Cell::Int(i) => Object::Int(*i),
            Cell::Float(f) => Object::Float(*f),
            Cell::Text(s) => Object::Str(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_normalisation() {
        assert_eq!(Key::of(&Value::Bool(true)), Some(Key::Int(1)));
        assert_eq!(Key::of(&Value::Float(2.0)), Some(Key::Int(2)));
        assert_eq!(Key::of(&Value::Ref(0)), None);
        assert_eq!(
            Key::of(&Value::Tuple(vec![Value::Int(1), Value::str("a")])),
            Some(Key::Tuple(vec![Key::Int(1), Key::Str("a".into())]))
        );
    }

    #[test]
    fn test_dict_heap_object_serializes() {
        let mut map = IndexMap::new();
        map.insert(Key::Int(1), (Value::Int(1), Value::str("one")));
        let obj = HeapObject::Dict(map);
        let text = serde_json::to_string(&obj).unwrap();
        let back: HeapObject = serde_json::from_str(&text).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_object_json() {
        let obj = Object::from_json(&json!([{"age": 22, "fare": 7.25, "name": null}]));
        let Object::List(rows) = &obj else { panic!() };
        assert_eq!(rows[0].get("age"), Some(&Object::Int(22)));
        assert_eq!(obj.to_json(), json!([{"age": 22, "fare": 7.25, "name": null}]));
        assert_eq!(
            Object::Dict(vec![(Object::Int(1), Object::Float(f64::NAN))]).to_json(),
            json!({"1": null})
        );
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -2), 5);
        assert_eq!(range_len(5, 5, 1), 0);
    }
}
