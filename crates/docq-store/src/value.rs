//! Value helpers shared by filters, updates, sorting and projection:
//! dotted-path access, numeric-aware equality, and a total order across
//! JSON types.

use std::cmp::Ordering;

use serde_json::{Map, Value};

/// Every value reachable at a dotted `path`, expanding arrays along the way.
///
/// `{"tags": ["a", "b"]}` at `tags` yields the array itself; at `tags.0`
/// yields `"a"`. `{"items": [{"n": 1}, {"n": 2}]}` at `items.n` yields both
/// `1` and `2`. A missing path yields nothing.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect(doc, &parts, &mut out);
    out
}

fn collect<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect(child, rest, out);
                }
            } else {
                for item in items {
                    if item.is_object() {
                        collect(item, parts, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// The first value at a dotted path, without array expansion of the result.
pub fn first<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    lookup(doc, path).into_iter().next()
}

/// Mutable access to the object that holds the last segment of `path`,
/// creating intermediate objects when `create` is set.
///
/// Returns `Ok(None)` when an intermediate segment is missing and `create`
/// is off, and `Err` when an intermediate value is not a container.
pub fn parent_mut<'a>(
    doc: &'a mut Value,
    path: &str,
    create: bool,
) -> Result<Option<(&'a mut Value, String)>, String> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts
        .pop()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| format!("invalid field path '{path}'"))?;

    let mut current = doc;
    for part in parts {
        current = match current {
            Value::Object(map) => {
                if !map.contains_key(part) {
                    if !create {
                        return Ok(None);
                    }
                    map.insert(part.to_string(), Value::Object(Map::new()));
                }
                map.get_mut(part).ok_or_else(|| format!("invalid field path '{path}'"))?
            }
            Value::Array(items) => {
                let index: usize = part
                    .parse()
                    .map_err(|_| format!("cannot index array with '{part}' in '{path}'"))?;
                match items.get_mut(index) {
                    Some(item) => item,
                    None if create => {
                        return Err(format!("array index {index} out of bounds in '{path}'"))
                    }
                    None => return Ok(None),
                }
            }
            _ => return Err(format!("cannot traverse non-container at '{part}' in '{path}'")),
        };
    }

    match current {
        Value::Object(_) | Value::Array(_) => Ok(Some((current, last.to_string()))),
        _ => Err(format!("cannot set field '{last}' on a non-object in '{path}'")),
    }
}

/// Read a child of a container by key (objects) or index (arrays).
pub fn child<'a>(container: &'a Value, key: &str) -> Option<&'a Value> {
    match container {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Set a child of a container by key (objects) or index (arrays).
pub fn set_child(container: &mut Value, key: &str, value: Value) -> Result<(), String> {
    match container {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index: usize = key
                .parse()
                .map_err(|_| format!("cannot index array with '{key}'"))?;
            match items.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(format!("array index {index} out of bounds")),
            }
        }
        _ => Err(format!("cannot set '{key}' on a non-container")),
    }
}

/// Remove a child of an object; arrays get `null` at the index.
pub fn remove_child(container: &mut Value, key: &str) -> bool {
    match container {
        Value::Object(map) => map.remove(key).is_some(),
        Value::Array(items) => match key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(slot) => {
                *slot = Value::Null;
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Rank of a JSON type in the cross-type sort order.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Order two values of the same JSON type; `None` across types.
///
/// Used by range operators, which never match across types.
pub fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            Some(total_cmp(a, b))
        }
        _ => None,
    }
}

/// A total order over JSON values: null < numbers < strings < objects <
/// arrays < booleans, then by value within a type.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(a, b)| total_cmp(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| total_cmp(va, vb)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => Ordering::Equal,
    }
}
