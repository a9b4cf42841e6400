//! Built-in functions.

use std::cmp::Ordering;

use super::ast::BinOp;
use super::error::Fault;
use super::value::{Builtin, HeapObject, IterState, Value};
use super::vm::{as_int, as_number, Num, Vm};

/// Remove keyword `name` from `kwargs`.
pub(super) fn take_kw(kwargs: &mut Vec<(String, Value)>, name: &str) -> Option<Value> {
    let pos = kwargs.iter().position(|(k, _)| k == name)?;
    Some(kwargs.remove(pos).1)
}

pub(super) fn reject_kwargs(func: &str, kwargs: &[(String, Value)]) -> Result<(), Fault> {
    match kwargs.first() {
        Some((key, _)) => Err(Fault::type_error(format!(
            "{func}() got an unexpected keyword argument '{key}'"
        ))),
        None => Ok(()),
    }
}

pub(super) fn arity(func: &str, args: &[Value], min: usize, max: usize) -> Result<(), Fault> {
    let n = args.len();
    if n >= min && n <= max {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {min}")
    } else if n < min {
        format!("at least {min}")
    } else {
        format!("at most {max}")
    };
    Err(Fault::type_error(format!(
        "{func}() takes {expected} argument{} ({n} given)",
        if min == max && min == 1 { "" } else { "s" }
    )))
}

impl Vm {
    pub(super) fn call_builtin(
        &mut self,
        builtin: Builtin,
        mut args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        let name = builtin.name();
        match builtin {
            Builtin::Len => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 1)?;
                Ok(Value::Int(self.len_of(&args[0])? as i64))
            }
            Builtin::Sum => {
                let start = take_kw(&mut kwargs, "start");
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 2)?;
                let mut acc = args.get(1).cloned().or(start).unwrap_or(Value::Int(0));
                if matches!(acc, Value::Str(_)) {
                    return Err(Fault::type_error(
                        "sum() can't sum strings [use ''.join(seq) instead]",
                    ));
                }
                for item in self.iterate(&args[0])? {
                    acc = self.binary(BinOp::Add, acc, item)?;
                }
                Ok(acc)
            }
            Builtin::Min | Builtin::Max => self.min_max(builtin, args, kwargs),
            Builtin::Sorted => {
                let key = take_kw(&mut kwargs, "key").filter(|k| *k != Value::None);
                let reverse = take_kw(&mut kwargs, "reverse").is_some_and(|r| self.truthy(&r));
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 1)?;
                let items = self.iterate(&args[0])?;
                let sorted = self.sort_values(items, key.as_ref(), reverse)?;
                self.new_list(sorted)
            }
            Builtin::Reversed => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 1)?;
                let reversible = match &args[0] {
                    Value::Str(_) | Value::Tuple(_) => true,
                    Value::Ref(id) => matches!(self.obj(*id)?, HeapObject::List(_) | HeapObject::Dict(_)),
                    _ => false,
                };
                if !reversible {
                    return Err(Fault::type_error(format!(
                        "'{}' object is not reversible",
                        self.type_name(&args[0])
                    )));
                }
                let mut items = self.iterate(&args[0])?;
                items.reverse();
                self.new_iter(items)
            }
            Builtin::Range => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 3)?;
                let mut bounds = Vec::with_capacity(3);
                for arg in &args {
                    bounds.push(as_int(arg).ok_or_else(|| {
                        Fault::type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            self.type_name(arg)
                        ))
                    })?);
                }
                let (start, stop, step) = match bounds[..] {
                    [stop] => (0, stop, 1),
                    [start, stop] => (start, stop, 1),
                    [start, stop, step] => (start, stop, step),
                    _ => unreachable!("arity checked"),
                };
                if step == 0 {
                    return Err(Fault::value_error("range() arg 3 must not be zero"));
                }
                self.alloc(HeapObject::Iterator(IterState::Range {
                    next: start,
                    stop,
                    step,
                }))
            }
            Builtin::Enumerate => {
                let start = take_kw(&mut kwargs, "start");
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 2)?;
                let start = match args.get(1).cloned().or(start) {
                    Some(v) => as_int(&v)
                        .ok_or_else(|| Fault::type_error("enumerate() start must be an integer"))?,
                    None => 0,
                };
                let items = self.iterate(&args[0])?;
                self.charge(40 * items.len() as u64)?;
                let pairs = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Value::Tuple(vec![Value::Int(start + i as i64), item]))
                    .collect();
                self.new_iter(pairs)
            }
            Builtin::Zip => {
                reject_kwargs(name, &kwargs)?;
                let mut columns = Vec::with_capacity(args.len());
                for arg in &args {
                    columns.push(self.iterate(arg)?);
                }
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                self.charge(40 * rows as u64)?;
                let tuples = (0..rows)
                    .map(|r| Value::Tuple(columns.iter().map(|c| c[r].clone()).collect()))
                    .collect();
                self.new_iter(tuples)
            }
            Builtin::Map => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 2, usize::MAX)?;
                let func = args.remove(0);
                let mut columns = Vec::with_capacity(args.len());
                for arg in &args {
                    columns.push(self.iterate(arg)?);
                }
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(rows);
                for r in 0..rows {
                    let call_args = columns.iter().map(|c| c[r].clone()).collect();
                    out.push(self.call_callable(&func, call_args)?);
                }
                self.new_iter(out)
            }
            Builtin::Filter => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 2, 2)?;
                let items = self.iterate(&args[1])?;
                let mut kept = Vec::new();
                for item in items {
                    let keep = match &args[0] {
                        Value::None => self.truthy(&item),
                        func => {
                            let verdict = self.call_callable(func, vec![item.clone()])?;
                            self.truthy(&verdict)
                        }
                    };
                    if keep {
                        kept.push(item);
                    }
                }
                self.new_iter(kept)
            }
            Builtin::Round => {
                let ndigits = take_kw(&mut kwargs, "ndigits");
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 2)?;
                let ndigits = args.get(1).cloned().or(ndigits).filter(|v| *v != Value::None);
                round(&args[0], ndigits.as_ref(), self)
            }
            Builtin::Abs => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 1)?;
                match as_number(&args[0]) {
                    Some(Num::Int(i)) => i.checked_abs().map(Value::Int).ok_or_else(Fault::overflow),
                    Some(Num::Float(f)) => Ok(Value::Float(f.abs())),
                    None => Err(Fault::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        self.type_name(&args[0])
                    ))),
                }
            }
            Builtin::Str | Builtin::Repr => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, if builtin == Builtin::Str { 0 } else { 1 }, 1)?;
                let text = match args.first() {
                    None => String::new(),
                    Some(v) if builtin == Builtin::Str => self.to_str(v),
                    Some(v) => self.repr(v),
                };
                self.new_str(text)
            }
            Builtin::Int => {
                let base = take_kw(&mut kwargs, "base");
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 0, 2)?;
                let base = args.get(1).cloned().or(base);
                match args.first() {
                    None => Ok(Value::Int(0)),
                    Some(v) => to_int(v, base.as_ref(), self),
                }
            }
            Builtin::Float => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::Float(0.0)),
                    Some(v) => to_float(v, self),
                }
            }
            Builtin::Bool => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().is_some_and(|v| self.truthy(v))))
            }
            Builtin::List | Builtin::Tuple | Builtin::Set => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 0, 1)?;
                let items = match args.first() {
                    Some(v) => self.iterate(v)?,
                    None => Vec::new(),
                };
                match builtin {
                    Builtin::List => self.new_list(items),
                    Builtin::Set => self.new_set(items),
                    _ => {
                        self.charge(24 + 16 * items.len() as u64)?;
                        Ok(Value::Tuple(items))
                    }
                }
            }
            Builtin::Dict => {
                arity(name, &args, 0, 1)?;
                let mut pairs = Vec::new();
                if let Some(source) = args.first() {
                    pairs = self.pairs_of(source)?;
                }
                for (key, value) in kwargs {
                    pairs.push((Value::Str(key), value));
                }
                self.new_dict(pairs)
            }
            Builtin::Type => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 1)?;
                Ok(Value::Builtin(self.type_of(&args[0])))
            }
            Builtin::Isinstance => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 2, 2)?;
                let candidates = match &args[1] {
                    Value::Tuple(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let actual = self.type_of(&args[0]);
                let mut matched = false;
                for candidate in &candidates {
                    match candidate {
                        Value::Builtin(t) if t.is_type() => {
                            matched |= *t == actual
                                || (*t == Builtin::Int && actual == Builtin::Bool);
                        }
                        _ => {
                            return Err(Fault::type_error(
                                "isinstance() arg 2 must be a type or tuple of types",
                            ))
                        }
                    }
                }
                Ok(Value::Bool(matched))
            }
            Builtin::Print => {
                let sep = take_kw(&mut kwargs, "sep").filter(|v| *v != Value::None);
                let end = take_kw(&mut kwargs, "end").filter(|v| *v != Value::None);
                reject_kwargs(name, &kwargs)?;
                let sep = sep.map(|v| self.to_str(&v)).unwrap_or_else(|| " ".into());
                let end = end.map(|v| self.to_str(&v)).unwrap_or_else(|| "\n".into());
                let mut line = args
                    .iter()
                    .map(|v| self.to_str(v))
                    .collect::<Vec<_>>()
                    .join(&sep);
                line.push_str(&end);
                self.charge(line.len() as u64)?;
                self.state.stdout.push_str(&line);
                Ok(Value::None)
            }
            Builtin::Any | Builtin::All => {
                reject_kwargs(name, &kwargs)?;
                arity(name, &args, 1, 1)?;
                let items = self.iterate(&args[0])?;
                Ok(Value::Bool(if builtin == Builtin::Any {
                    items.iter().any(|v| self.truthy(v))
                } else {
                    items.iter().all(|v| self.truthy(v))
                }))
            }
            Builtin::NoneType | Builtin::FunctionType | Builtin::IteratorType => Err(
                Fault::type_error(format!("cannot create '{name}' instances")),
            ),
        }
    }

    fn min_max(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        let name = builtin.name();
        let key = take_kw(&mut kwargs, "key").filter(|k| *k != Value::None);
        let default = take_kw(&mut kwargs, "default");
        reject_kwargs(name, &kwargs)?;
        arity(name, &args, 1, usize::MAX)?;
        let items = if args.len() == 1 {
            self.iterate(&args[0])?
        } else {
            args
        };
        if items.is_empty() {
            return default
                .ok_or_else(|| Fault::value_error(format!("{name}() arg is an empty sequence")));
        }
        let (wanted, symbol) = if builtin == Builtin::Max {
            (Ordering::Greater, ">")
        } else {
            (Ordering::Less, "<")
        };
        let mut best: Option<(Value, Value)> = None;
        for item in items {
            let k = match &key {
                Some(f) => self.call_callable(f, vec![item.clone()])?,
                None => item.clone(),
            };
            let replace = match &best {
                None => true,
                Some((best_key, _)) => self.compare_values(&k, best_key, symbol)? == wanted,
            };
            if replace {
                best = Some((k, item));
            }
        }
        Ok(best.map(|(_, v)| v).unwrap_or(Value::None))
    }

    /// Stable sort, optionally by key. Equal elements keep their order even
    /// when `reverse` is set.
    pub(super) fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<&Value>,
        reverse: bool,
    ) -> Result<Vec<Value>, Fault> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let k = match key {
                Some(f) => self.call_callable(f, vec![item.clone()])?,
                None => item.clone(),
            };
            keyed.push((k, item));
        }
        let mut failure = None;
        keyed.sort_by(|(a, _), (b, _)| {
            let (x, y) = if reverse { (b, a) } else { (a, b) };
            match self.compare_values(x, y, "<") {
                Ok(ordering) => ordering,
                Err(fault) => {
                    failure.get_or_insert(fault);
                    Ordering::Equal
                }
            }
        });
        match failure {
            Some(fault) => Err(fault),
            None => Ok(keyed.into_iter().map(|(_, v)| v).collect()),
        }
    }

    /// Key/value pairs from a dict or an iterable of 2-item sequences.
    pub(super) fn pairs_of(&mut self, source: &Value) -> Result<Vec<(Value, Value)>, Fault> {
        if let Value::Ref(id) = source {
            if let HeapObject::Dict(map) = self.obj(*id)? {
                return Ok(map.values().cloned().collect());
            }
        }
        let mut pairs = Vec::new();
        for (i, item) in self.iterate(source)?.into_iter().enumerate() {
            let parts = self.iterate(&item)?;
            let [k, v]: [Value; 2] = parts.try_into().map_err(|parts: Vec<Value>| {
                Fault::value_error(format!(
                    "dictionary update sequence element #{i} has length {}; 2 is required",
                    parts.len()
                ))
            })?;
            pairs.push((k, v));
        }
        Ok(pairs)
    }

    pub(super) fn type_of(&self, value: &Value) -> Builtin {
        match value {
            Value::None => Builtin::NoneType,
            Value::Bool(_) => Builtin::Bool,
            Value::Int(_) => Builtin::Int,
            Value::Float(_) => Builtin::Float,
            Value::Str(_) => Builtin::Str,
            Value::Tuple(_) => Builtin::Tuple,
            Value::Ref(id) => match self.obj(*id) {
                Ok(HeapObject::List(_)) => Builtin::List,
                Ok(HeapObject::Dict(_)) => Builtin::Dict,
                Ok(HeapObject::Set(_)) => Builtin::Set,
                Ok(HeapObject::Iterator(_)) => Builtin::IteratorType,
                _ => Builtin::FunctionType,
            },
            Value::Builtin(_) | Value::External(_) | Value::Slice { .. } => Builtin::FunctionType,
        }
    }
}

fn round(value: &Value, ndigits: Option<&Value>, vm: &Vm) -> Result<Value, Fault> {
    let number = as_number(value).ok_or_else(|| {
        Fault::type_error(format!(
            "type {} doesn't define __round__ method",
            vm.type_name(value)
        ))
    })?;
    let digits = match ndigits {
        None => None,
        Some(d) => Some(
            as_int(d).ok_or_else(|| Fault::type_error("ndigits must be an integer"))?,
        ),
    };
    match (number, digits) {
        (Num::Int(i), None) => Ok(Value::Int(i)),
        (Num::Int(i), Some(d)) if d >= 0 => Ok(Value::Int(i)),
        (Num::Int(i), Some(d)) => {
            let scale = 10f64.powi(-d.max(-18) as i32);
            Ok(Value::Int(((i as f64 / scale).round_ties_even() * scale) as i64))
        }
        (Num::Float(f), None) => {
            if f.is_nan() {
                return Err(Fault::value_error("cannot convert float NaN to integer"));
            }
            let r = f.round_ties_even();
            if r.is_infinite() || r.abs() >= 9.2e18 {
                return Err(Fault::overflow());
            }
            Ok(Value::Int(r as i64))
        }
        (Num::Float(f), Some(d)) => {
            if !f.is_finite() {
                return Ok(Value::Float(f));
            }
            let d = d.clamp(-308, 308) as i32;
            let scale = 10f64.powi(d);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
    }
}

fn to_int(value: &Value, base: Option<&Value>, vm: &Vm) -> Result<Value, Fault> {
    if let Some(base) = base {
        let Value::Str(text) = value else {
            return Err(Fault::type_error(
                "int() can't convert non-string with explicit base",
            ));
        };
        let radix = as_int(base)
            .filter(|b| (2..=36).contains(b))
            .ok_or_else(|| Fault::value_error("int() base must be >= 2 and <= 36"))?;
        let cleaned = text.trim().replace('_', "");
        let digits = match radix {
            16 => cleaned.trim_start_matches("0x").trim_start_matches("0X"),
            8 => cleaned.trim_start_matches("0o").trim_start_matches("0O"),
            2 => cleaned.trim_start_matches("0b").trim_start_matches("0B"),
            _ => cleaned.as_str(),
        };
        return i64::from_str_radix(digits, radix as u32)
            .map(Value::Int)
            .map_err(|_| {
                Fault::value_error(format!(
                    "invalid literal for int() with base {radix}: {}",
                    vm.repr(value)
                ))
            });
    }
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => {
            if f.is_nan() {
                Err(Fault::value_error("cannot convert float NaN to integer"))
            } else if f.is_infinite() || f.abs() >= 9.2e18 {
                Err(Fault::overflow())
            } else {
                Ok(Value::Int(f.trunc() as i64))
            }
        }
        Value::Str(text) => text
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                Fault::value_error(format!(
                    "invalid literal for int() with base 10: {}",
                    vm.repr(value)
                ))
            }),
        other => Err(Fault::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            vm.type_name(other)
        ))),
    }
}

fn to_float(value: &Value, vm: &Vm) -> Result<Value, Fault> {
    match value {
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::Str(text) => {
            let cleaned = text.trim().to_ascii_lowercase();
            let parsed = match cleaned.trim_start_matches(['+', '-']) {
                "inf" | "infinity" => Some(f64::INFINITY),
                "nan" => Some(f64::NAN),
                _ => None,
            };
            let parsed = match parsed {
                Some(v) if cleaned.starts_with('-') => Some(-v),
                Some(v) => Some(v),
                None => cleaned.replace('_', "").parse::<f64>().ok(),
            };
            parsed.map(Value::Float).ok_or_else(|| {
                Fault::value_error(format!(
                    "could not convert string to float: {}",
                    vm.repr(value)
                ))
            })
        }
        other => Err(Fault::type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            vm.type_name(other)
        ))),
    }
}

