//! Methods on built-in types: `receiver.name(args)`.

use super::builtins::{arity, reject_kwargs, take_kw};
use super::error::Fault;
use super::format;
use super::value::{HeapObject, ObjId, Value};
use super::vm::{as_int, normalize_index, Vm};

impl Vm {
    pub(super) fn call_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        match &receiver {
            Value::Str(s) => self.str_method(s, name, args, kwargs),
            Value::Tuple(items) => {
                reject_kwargs(name, &kwargs)?;
                match name {
                    "count" => {
                        arity(name, &args, 1, 1)?;
                        let n = items.iter().filter(|v| self.values_equal(v, &args[0])).count();
                        Ok(Value::Int(n as i64))
                    }
                    "index" => {
                        arity(name, &args, 1, 1)?;
                        items
                            .iter()
                            .position(|v| self.values_equal(v, &args[0]))
                            .map(|i| Value::Int(i as i64))
                            .ok_or_else(|| Fault::value_error("tuple.index(x): x not in tuple"))
                    }
                    _ => Err(self.no_attribute(&receiver, name)),
                }
            }
            Value::Ref(id) => match self.obj(*id)? {
                HeapObject::List(_) => self.list_method(*id, name, args, kwargs),
                HeapObject::Dict(_) => self.dict_method(*id, name, args, kwargs),
                HeapObject::Set(_) => self.set_method(*id, name, args, kwargs),
                _ => Err(self.no_attribute(&receiver, name)),
            },
            _ => Err(self.no_attribute(&receiver, name)),
        }
    }

    fn no_attribute(&self, receiver: &Value, name: &str) -> Fault {
        Fault::runtime(format!(
            "AttributeError: '{}' object has no attribute '{name}'",
            self.type_name(receiver)
        ))
    }

    fn str_arg(&self, func: &str, value: &Value) -> Result<String, Fault> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            other => Err(Fault::type_error(format!(
                "{func}() argument must be str, not {}",
                self.type_name(other)
            ))),
        }
    }

    fn str_method(
        &mut self,
        s: &str,
        name: &str,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        if name == "format" {
            let text = format::str_format(s, &args, &kwargs, &*self)?;
            return self.new_str(text);
        }
        let (sep, maxsplit) = if name == "split" || name == "rsplit" {
            (take_kw(&mut kwargs, "sep"), take_kw(&mut kwargs, "maxsplit"))
        } else {
            (None, None)
        };
        reject_kwargs(name, &kwargs)?;

        match name {
            "upper" | "lower" | "title" | "capitalize" | "swapcase" => {
                arity(name, &args, 0, 0)?;
                let out = match name {
                    "upper" => s.to_uppercase(),
                    "lower" => s.to_lowercase(),
                    "title" => title_case(s),
                    "swapcase" => s
                        .chars()
                        .map(|c| {
                            if c.is_uppercase() {
                                c.to_lowercase().collect::<String>()
                            } else {
                                c.to_uppercase().collect()
                            }
                        })
                        .collect(),
                    _ => {
                        let mut chars = s.chars();
                        match chars.next() {
                            Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
                            None => String::new(),
                        }
                    }
                };
                self.new_str(out)
            }
            "strip" | "lstrip" | "rstrip" => {
                arity(name, &args, 0, 1)?;
                let chars: Option<Vec<char>> = match args.first() {
                    None | Some(Value::None) => None,
                    Some(v) => Some(self.str_arg(name, v)?.chars().collect()),
                };
                let matcher = |c: char| match &chars {
                    Some(set) => set.contains(&c),
                    None => c.is_whitespace(),
                };
                let out = match name {
                    "strip" => s.trim_matches(matcher),
                    "lstrip" => s.trim_start_matches(matcher),
                    _ => s.trim_end_matches(matcher),
                };
                self.new_str(out.to_string())
            }
            "split" | "rsplit" => {
                arity(name, &args, 0, 2)?;
                let sep = args.first().cloned().or(sep).filter(|v| *v != Value::None);
                let maxsplit = match args.get(1).cloned().or(maxsplit) {
                    Some(v) => as_int(&v).ok_or_else(|| Fault::type_error("maxsplit must be an integer"))?,
                    None => -1,
                };
                let parts: Vec<String> = match sep {
                    None => split_whitespace(s, maxsplit, name == "rsplit"),
                    Some(sep) => {
                        let sep = self.str_arg(name, &sep)?;
                        if sep.is_empty() {
                            return Err(Fault::value_error("empty separator"));
                        }
                        match (maxsplit < 0, name == "rsplit") {
                            (true, _) => s.split(sep.as_str()).map(String::from).collect(),
                            (false, false) => s
                                .splitn(maxsplit as usize + 1, sep.as_str())
                                .map(String::from)
                                .collect(),
                            (false, true) => {
                                let mut parts: Vec<String> = s
                                    .rsplitn(maxsplit as usize + 1, sep.as_str())
                                    .map(String::from)
                                    .collect();
                                parts.reverse();
                                parts
                            }
                        }
                    }
                };
                self.charge(parts.iter().map(|p| 24 + p.len() as u64).sum())?;
                let items = parts.into_iter().map(Value::Str).collect();
                self.new_list(items)
            }
            "splitlines" => {
                arity(name, &args, 0, 0)?;
                let items = s.lines().map(Value::str).collect();
                self.new_list(items)
            }
            "join" => {
                arity(name, &args, 1, 1)?;
                let items = self.iterate(&args[0])?;
                let mut pieces = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Value::Str(piece) => pieces.push(piece.as_str()),
                        other => {
                            return Err(Fault::type_error(format!(
                                "sequence item {i}: expected str instance, {} found",
                                self.type_name(other)
                            )))
                        }
                    }
                }
                let joined = pieces.join(s);
                self.new_str(joined)
            }
            "replace" => {
                arity(name, &args, 2, 3)?;
                let old = self.str_arg(name, &args[0])?;
                let new = self.str_arg(name, &args[1])?;
                let out = match args.get(2).and_then(as_int) {
                    Some(n) if n >= 0 => s.replacen(old.as_str(), &new, n as usize),
                    _ => s.replace(old.as_str(), &new),
                };
                self.new_str(out)
            }
            "startswith" | "endswith" => {
                arity(name, &args, 1, 1)?;
                let candidates = match &args[0] {
                    Value::Tuple(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let mut hit = false;
                for candidate in &candidates {
                    let affix = self.str_arg(name, candidate)?;
                    hit |= if name == "startswith" {
                        s.starts_with(affix.as_str())
                    } else {
                        s.ends_with(affix.as_str())
                    };
                }
                Ok(Value::Bool(hit))
            }
            "find" | "index" | "rfind" => {
                arity(name, &args, 1, 1)?;
                let needle = self.str_arg(name, &args[0])?;
                let found = if name == "rfind" {
                    s.rfind(needle.as_str())
                } else {
                    s.find(needle.as_str())
                };
                match found {
                    Some(byte) => Ok(Value::Int(s[..byte].chars().count() as i64)),
                    None if name == "index" => Err(Fault::value_error("substring not found")),
                    None => Ok(Value::Int(-1)),
                }
            }
            "count" => {
                arity(name, &args, 1, 1)?;
                let needle = self.str_arg(name, &args[0])?;
                let n = if needle.is_empty() {
                    s.chars().count() + 1
                } else {
                    s.matches(needle.as_str()).count()
                };
                Ok(Value::Int(n as i64))
            }
            "isdigit" | "isalpha" | "isalnum" | "isspace" | "isupper" | "islower" => {
                arity(name, &args, 0, 0)?;
                let result = match name {
                    "isdigit" => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
                    "isalpha" => !s.is_empty() && s.chars().all(char::is_alphabetic),
                    "isalnum" => !s.is_empty() && s.chars().all(char::is_alphanumeric),
                    "isspace" => !s.is_empty() && s.chars().all(char::is_whitespace),
                    "isupper" => s.chars().any(char::is_uppercase) && !s.chars().any(char::is_lowercase),
                    _ => s.chars().any(char::is_lowercase) && !s.chars().any(char::is_uppercase),
                };
                Ok(Value::Bool(result))
            }
            "zfill" => {
                arity(name, &args, 1, 1)?;
                let width = as_int(&args[0]).unwrap_or(0).max(0) as usize;
                let len = s.chars().count();
                if len >= width {
                    return Ok(Value::str(s));
                }
                let (sign, rest) = match s.strip_prefix(['-', '+']) {
                    Some(rest) => (&s[..1], rest),
                    None => ("", s),
                };
                let padded = format!("{sign}{}{rest}", "0".repeat(width - len));
                self.new_str(padded)
            }
            _ => Err(self.no_attribute(&Value::str(s), name)),
        }
    }

    fn list_items(&self, id: ObjId) -> Result<Vec<Value>, Fault> {
        match self.obj(id)? {
            HeapObject::List(items) => Ok(items.clone()),
            _ => Err(Fault::runtime("expected list")),
        }
    }

    fn list_mut(&mut self, id: ObjId) -> Result<&mut Vec<Value>, Fault> {
        match self.obj_mut(id)? {
            HeapObject::List(items) => Ok(items),
            _ => Err(Fault::runtime("expected list")),
        }
    }

    fn list_method(
        &mut self,
        id: ObjId,
        name: &str,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        if name == "sort" {
            let key = take_kw(&mut kwargs, "key").filter(|k| *k != Value::None);
            let reverse = take_kw(&mut kwargs, "reverse").is_some_and(|r| self.truthy(&r));
            reject_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 0)?;
            let items = self.list_items(id)?;
            let sorted = self.sort_values(items, key.as_ref(), reverse)?;
            *self.list_mut(id)? = sorted;
            return Ok(Value::None);
        }
        reject_kwargs(name, &kwargs)?;

        match name {
            "append" => {
                arity(name, &args, 1, 1)?;
                self.charge(16)?;
                let mut args = args;
                self.list_mut(id)?.push(args.remove(0));
                Ok(Value::None)
            }
            "extend" => {
                arity(name, &args, 1, 1)?;
                let more = self.iterate(&args[0])?;
                self.charge(16 * more.len() as u64)?;
                self.list_mut(id)?.extend(more);
                Ok(Value::None)
            }
            "insert" => {
                arity(name, &args, 2, 2)?;
                let index = as_int(&args[0])
                    .ok_or_else(|| Fault::type_error("list indices must be integers"))?;
                self.charge(16)?;
                let items = self.list_mut(id)?;
                let len = items.len() as i64;
                let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.insert(at as usize, args[1].clone());
                Ok(Value::None)
            }
            "pop" => {
                arity(name, &args, 0, 1)?;
                let index = match args.first() {
                    Some(v) => as_int(v).ok_or_else(|| Fault::type_error("list indices must be integers"))?,
                    None => -1,
                };
                let items = self.list_mut(id)?;
                if items.is_empty() {
                    return Err(Fault::index_error("pop from empty list"));
                }
                let slot = normalize_index(index, items.len())
                    .ok_or_else(|| Fault::index_error("pop index out of range"))?;
                Ok(items.remove(slot))
            }
            "remove" | "index" | "count" => {
                arity(name, &args, 1, 1)?;
                let items = self.list_items(id)?;
                let position = items.iter().position(|v| self.values_equal(v, &args[0]));
                match name {
                    "count" => {
                        let n = items.iter().filter(|v| self.values_equal(v, &args[0])).count();
                        Ok(Value::Int(n as i64))
                    }
                    "index" => position.map(|i| Value::Int(i as i64)).ok_or_else(|| {
                        Fault::value_error(format!("{} is not in list", self.repr(&args[0])))
                    }),
                    _ => {
                        let slot = position
                            .ok_or_else(|| Fault::value_error("list.remove(x): x not in list"))?;
                        self.list_mut(id)?.remove(slot);
                        Ok(Value::None)
                    }
                }
            }
            "reverse" => {
                arity(name, &args, 0, 0)?;
                self.list_mut(id)?.reverse();
                Ok(Value::None)
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                self.list_mut(id)?.clear();
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                let items = self.list_items(id)?;
                self.new_list(items)
            }
            _ => Err(self.no_attribute(&Value::Ref(id), name)),
        }
    }

    fn dict_method(
        &mut self,
        id: ObjId,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        if name != "update" {
            reject_kwargs(name, &kwargs)?;
        }
        let entries = match self.obj(id)? {
            HeapObject::Dict(map) => map.clone(),
            _ => return Err(Fault::runtime("expected dict")),
        };

        match name {
            "get" => {
                arity(name, &args, 1, 2)?;
                let key = self.key_of(&args[0])?;
                Ok(entries
                    .get(&key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            "keys" | "values" | "items" => {
                arity(name, &args, 0, 0)?;
                let items = entries
                    .into_values()
                    .map(|(k, v)| match name {
                        "keys" => k,
                        "values" => v,
                        _ => Value::Tuple(vec![k, v]),
                    })
                    .collect();
                self.new_list(items)
            }
            "pop" => {
                arity(name, &args, 1, 2)?;
                let key = self.key_of(&args[0])?;
                let missing = Fault::key_error(self.repr(&args[0]));
                let removed = match self.obj_mut(id)? {
                    HeapObject::Dict(map) => map.shift_remove(&key),
                    _ => None,
                };
                match (removed, args.get(1)) {
                    (Some((_, v)), _) => Ok(v),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(missing),
                }
            }
            "setdefault" => {
                arity(name, &args, 1, 2)?;
                let key = self.key_of(&args[0])?;
                if let Some((_, v)) = entries.get(&key) {
                    return Ok(v.clone());
                }
                let default = args.get(1).cloned().unwrap_or(Value::None);
                self.charge(48)?;
                if let HeapObject::Dict(map) = self.obj_mut(id)? {
                    map.insert(key, (args[0].clone(), default.clone()));
                }
                Ok(default)
            }
            "update" => {
                arity(name, &args, 0, 1)?;
                let mut pairs = match args.first() {
                    Some(source) => self.pairs_of(source)?,
                    None => Vec::new(),
                };
                pairs.extend(kwargs.into_iter().map(|(k, v)| (Value::Str(k), v)));
                let mut hashed = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    hashed.push((self.key_of(&k)?, (k, v)));
                }
                self.charge(48 * hashed.len() as u64)?;
                if let HeapObject::Dict(map) = self.obj_mut(id)? {
                    map.extend(hashed);
                }
                Ok(Value::None)
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                if let HeapObject::Dict(map) = self.obj_mut(id)? {
                    map.clear();
                }
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                self.alloc(HeapObject::Dict(entries))
            }
            _ => Err(self.no_attribute(&Value::Ref(id), name)),
        }
    }

    fn set_method(
        &mut self,
        id: ObjId,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        reject_kwargs(name, &kwargs)?;
        let members = match self.obj(id)? {
            HeapObject::Set(set) => set.clone(),
            _ => return Err(Fault::runtime("expected set")),
        };

        match name {
            "add" | "discard" | "remove" => {
                arity(name, &args, 1, 1)?;
                let key = self.key_of(&args[0])?;
                if name == "remove" && !members.contains_key(&key) {
                    return Err(Fault::key_error(self.repr(&args[0])));
                }
                if name == "add" {
                    self.charge(32)?;
                }
                if let HeapObject::Set(set) = self.obj_mut(id)? {
                    if name == "add" {
                        set.entry(key).or_insert_with(|| args[0].clone());
                    } else {
                        set.shift_remove(&key);
                    }
                }
                Ok(Value::None)
            }
            "union" | "intersection" | "difference" => {
                let mut result = members;
                for other in &args {
                    let mut other_keys = indexmap::IndexMap::new();
                    for item in self.iterate(other)? {
                        other_keys.insert(self.key_of(&item)?, item);
                    }
                    match name {
                        "union" => {
                            for (k, v) in other_keys {
                                result.entry(k).or_insert(v);
                            }
                        }
                        "intersection" => result.retain(|k, _| other_keys.contains_key(k)),
                        _ => result.retain(|k, _| !other_keys.contains_key(k)),
                    }
                }
                self.alloc(HeapObject::Set(result))
            }
            "issubset" | "issuperset" => {
                arity(name, &args, 1, 1)?;
                let mut other_keys = std::collections::HashSet::new();
                for item in self.iterate(&args[0])? {
                    other_keys.insert(self.key_of(&item)?);
                }
                Ok(Value::Bool(if name == "issubset" {
                    members.keys().all(|k| other_keys.contains(k))
                } else {
                    other_keys.iter().all(|k| members.contains_key(k))
                }))
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                self.alloc(HeapObject::Set(members))
            }
            _ => Err(self.no_attribute(&Value::Ref(id), name)),
        }
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_cased = false;
    for c in s.chars() {
        if prev_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        prev_cased = c.is_alphabetic();
    }
    out
}

fn split_whitespace(s: &str, maxsplit: i64, from_right: bool) -> Vec<String> {
    if maxsplit < 0 {
        return s.split_whitespace().map(String::from).collect();
    }
    let limit = maxsplit as usize;
    if from_right {
        let mut parts = Vec::new();
        let mut rest = s.trim_end();
        while parts.len() < limit {
            match rest.rfind(char::is_whitespace) {
                Some(pos) => {
                    let word_start = pos + rest[pos..].chars().next().map_or(1, char::len_utf8);
                    parts.push(rest[word_start..].to_string());
                    rest = rest[..pos].trim_end();
                }
                None => break,
            }
        }
        if !rest.is_empty() {
            parts.push(rest.to_string());
        }
        parts.reverse();
        parts
    } else {
        let mut parts = Vec::new();
        let mut rest = s.trim_start();
        while parts.len() < limit {
            match rest.find(char::is_whitespace) {
                Some(pos) => {
                    parts.push(rest[..pos].to_string());
                    rest = rest[pos..].trim_start();
                }
                None => break,
            }
        }
        if !rest.is_empty() {
            parts.push(rest.to_string());
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("hello world"), "Hello World");
        assert_eq!(title_case("o'neil x2y"), "O'Neil X2Y");
    }

    #[test]
    fn test_split_whitespace_limits() {
        assert_eq!(split_whitespace("  a b  c ", -1, false), vec!["a", "b", "c"]);
        assert_eq!(split_whitespace("a b c", 1, false), vec!["a", "b c"]);
        assert_eq!(split_whitespace("a b c", 1, true), vec!["a b", "c"]);
    }
}
