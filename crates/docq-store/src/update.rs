//! Update documents: `$set $unset $inc $push $addToSet $pull`, plus
//! plain-document updates (treated as `$set`) and upsert seeding.

use docq_error::StoreError;
use serde_json::{Map, Value};

use crate::filter::matches;
use crate::value::{child, parent_mut, remove_child, set_child, values_equal};

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidCommand(msg.into())
}

/// Apply `update` to `doc` in place. Returns whether anything changed.
pub fn apply_update(doc: &mut Value, update: &Value) -> Result<bool, StoreError> {
    let Value::Object(spec) = update else {
        return Err(invalid("update must be an object"));
    };
    if spec.is_empty() {
        return Err(invalid("update document must not be empty"));
    }

    let operator_keys = spec.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        let mut set = Map::new();
        set.insert("$set".to_string(), update.clone());
        return apply_update(doc, &Value::Object(set));
    }
    if operator_keys != spec.len() {
        return Err(invalid("update mixes operators and plain fields"));
    }

    let before = doc.clone();
    for (op, fields) in spec {
        let Value::Object(fields) = fields else {
            return Err(invalid(format!("{op} requires an object of fields")));
        };
        for (path, arg) in fields {
            if path == "_id" || path.starts_with("_id.") {
                let current = doc.get("_id").cloned().unwrap_or(Value::Null);
                if op != "$set" || !values_equal(&current, arg) {
                    return Err(invalid("_id is immutable"));
                }
                continue;
            }
            apply_one(doc, op, path, arg)?;
        }
    }
    Ok(!values_equal(&before, doc))
}

fn apply_one(doc: &mut Value, op: &str, path: &str, arg: &Value) -> Result<(), StoreError> {
    match op {
        "$set" => {
            let (parent, key) = parent_mut(doc, path, true)
                .map_err(invalid)?
                .ok_or_else(|| invalid(format!("cannot set '{path}'")))?;
            set_child(parent, &key, arg.clone()).map_err(invalid)
        }
        "$unset" => {
            if let Some((parent, key)) = parent_mut(doc, path, false).map_err(invalid)? {
                remove_child(parent, &key);
            }
            Ok(())
        }
        "$inc" => {
            let Value::Number(delta) = arg else {
                return Err(invalid(format!("$inc on '{path}' requires a number")));
            };
            let (parent, key) = parent_mut(doc, path, true)
                .map_err(invalid)?
                .ok_or_else(|| invalid(format!("cannot increment '{path}'")))?;
            let next = match child(parent, &key) {
                None | Some(Value::Null) => Value::Number(delta.clone()),
                Some(Value::Number(current)) => add_numbers(current, delta),
                Some(_) => {
                    return Err(invalid(format!("cannot $inc non-numeric field '{path}'")))
                }
            };
            set_child(parent, &key, next).map_err(invalid)
        }
        "$push" | "$addToSet" => {
            let items = match arg {
                Value::Object(m) if m.contains_key("$each") => m["$each"]
                    .as_array()
                    .cloned()
                    .ok_or_else(|| invalid("$each requires an array"))?,
                single => vec![single.clone()],
            };
            let (parent, key) = parent_mut(doc, path, true)
                .map_err(invalid)?
                .ok_or_else(|| invalid(format!("cannot {op} to '{path}'")))?;
            let mut array = match child(parent, &key) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(existing)) => existing.clone(),
                Some(_) => return Err(invalid(format!("{op} target '{path}' is not an array"))),
            };
            for item in items {
                if op == "$addToSet" && array.iter().any(|e| values_equal(e, &item)) {
                    continue;
                }
                array.push(item);
            }
            set_child(parent, &key, Value::Array(array)).map_err(invalid)
        }
        "$pull" => {
            let Some((parent, key)) = parent_mut(doc, path, false).map_err(invalid)? else {
                return Ok(());
            };
            let array = match child(parent, &key) {
                None | Some(Value::Null) => return Ok(()),
                Some(Value::Array(existing)) => existing.clone(),
                Some(_) => return Err(invalid(format!("$pull target '{path}' is not an array"))),
            };
            let mut kept = Vec::with_capacity(array.len());
            for item in array {
                if !pull_matches(&item, arg)? {
                    kept.push(item);
                }
            }
            set_child(parent, &key, Value::Array(kept)).map_err(invalid)
        }
        other => Err(invalid(format!("unknown update operator '{other}'"))),
    }
}

/// `$pull` removes elements equal to `arg`, or matching it when `arg` is a
/// condition (`{"$gt": 3}`) or a sub-document filter.
fn pull_matches(item: &Value, arg: &Value) -> Result<bool, StoreError> {
    match arg {
        Value::Object(cond) if cond.keys().all(|k| k.starts_with('$')) && !cond.is_empty() => {
            let mut wrapper = Map::new();
            wrapper.insert("v".to_string(), item.clone());
            let mut filter = Map::new();
            filter.insert("v".to_string(), arg.clone());
            matches(&Value::Object(wrapper), &Value::Object(filter))
        }
        Value::Object(_) if item.is_object() => matches(item, arg),
        _ => Ok(values_equal(item, arg)),
    }
}

fn add_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Starting document for an upsert: the equality conditions of `filter`.
///
/// `{"name": "Ada", "age": {"$gt": 3}, "$or": [...]}` seeds `{"name": "Ada"}`;
/// `{"email": {"$eq": "a@b"}}` seeds `{"email": "a@b"}`.
pub fn upsert_seed(filter: &Value) -> Result<Value, StoreError> {
    let mut seed = Value::Object(Map::new());
    if let Value::Object(map) = filter {
        for (path, condition) in map {
            if path.starts_with('$') {
                if path == "$and" {
                    for clause in condition.as_array().into_iter().flatten() {
                        merge_seed(&mut seed, upsert_seed(clause)?)?;
                    }
                }
                continue;
            }
            let value = match condition {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    match ops.get("$eq") {
                        Some(v) => v.clone(),
                        None => continue,
                    }
                }
                literal => literal.clone(),
            };
            let (parent, key) = parent_mut(&mut seed, path, true)
                .map_err(invalid)?
                .ok_or_else(|| invalid(format!("cannot seed '{path}'")))?;
            set_child(parent, &key, value).map_err(invalid)?;
        }
    }
    Ok(seed)
}

fn merge_seed(into: &mut Value, from: Value) -> Result<(), StoreError> {
    if let (Value::Object(target), Value::Object(source)) = (into, from) {
        for (k, v) in source {
            target.insert(k, v);
        }
    }
    Ok(())
}
