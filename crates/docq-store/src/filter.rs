//! Query filter evaluation.
//!
//! Supported: implicit equality, `$eq $ne $gt $gte $lt $lte $in $nin
//! $exists $regex $options $not $size $all` on fields, `$and $or $nor` at
//! any level. Field names may be dotted paths; arrays match when any element
//! matches.

use std::cmp::Ordering;

use docq_error::StoreError;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::value::{compare_same_type, lookup, values_equal};

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidCommand(msg.into())
}

/// Whether `doc` satisfies `filter`. A `null` filter matches everything.
pub fn matches(doc: &Value, filter: &Value) -> Result<bool, StoreError> {
    match filter {
        Value::Null => Ok(true),
        Value::Object(map) => matches_object(doc, map),
        other => Err(invalid(format!("filter must be an object, got {other}"))),
    }
}

fn matches_object(doc: &Value, filter: &Map<String, Value>) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in clauses(key, condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in clauses(key, condition)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in clauses(key, condition)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(invalid(format!("unknown top-level operator '{op}'")))
            }
            path => matches_field(doc, path, condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, value: &'a Value) -> Result<&'a Vec<Value>, StoreError> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(invalid(format!("{op} requires a non-empty array"))),
    }
}

/// Whether an object is an operator expression (`{"$gt": 1}`) rather than a
/// literal sub-document.
fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn matches_field(doc: &Value, path: &str, condition: &Value) -> Result<bool, StoreError> {
    let candidates = lookup(doc, path);
    match condition {
        Value::Object(ops) if is_operator_object(ops) => eval_operators(&candidates, ops),
        literal => Ok(eq_match(&candidates, literal)),
    }
}

/// Equality against every candidate, with array membership and
/// `null` matching a missing field.
fn eq_match(candidates: &[&Value], expected: &Value) -> bool {
    if expected.is_null() && candidates.is_empty() {
        return true;
    }
    candidates.iter().any(|c| {
        values_equal(c, expected)
            || matches!(c, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
    })
}

/// Scalars to compare against: each candidate, and each element of array
/// candidates.
fn flatten<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for c in candidates {
        match c {
            Value::Array(items) => {
                out.push(*c);
                out.extend(items.iter());
            }
            _ => out.push(*c),
        }
    }
    out
}

fn range_match(candidates: &[&Value], bound: &Value, accept: fn(Ordering) -> bool) -> bool {
    flatten(candidates)
        .into_iter()
        .any(|c| compare_same_type(c, bound).is_some_and(accept))
}

fn eval_operators(candidates: &[&Value], ops: &Map<String, Value>) -> Result<bool, StoreError> {
    let options = match ops.get("$options") {
        None => "",
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(invalid("$options must be a string")),
    };

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_match(candidates, arg),
            "$ne" => !eq_match(candidates, arg),
            "$gt" => range_match(candidates, arg, Ordering::is_gt),
            "$gte" => range_match(candidates, arg, Ordering::is_ge),
            "$lt" => range_match(candidates, arg, Ordering::is_lt),
            "$lte" => range_match(candidates, arg, Ordering::is_le),
            "$in" => in_list(candidates, op, arg)?,
            "$nin" => !in_list(candidates, op, arg)?,
            "$exists" => {
                let want = match arg {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64() != Some(0.0),
                    _ => return Err(invalid("$exists requires a boolean")),
                };
                want == !candidates.is_empty()
            }
            "$regex" => {
                let re = build_regex(arg, options)?;
                regex_match(candidates, &re)
            }
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(invalid("$options without $regex"));
                }
                true
            }
            "$not" => match arg {
                Value::Object(inner) if is_operator_object(inner) => {
                    !eval_operators(candidates, inner)?
                }
                _ => return Err(invalid("$not requires an operator expression")),
            },
            "$size" => {
                let want = arg
                    .as_u64()
                    .ok_or_else(|| invalid("$size requires a non-negative integer"))?;
                candidates
                    .iter()
                    .any(|c| matches!(c, Value::Array(items) if items.len() as u64 == want))
            }
            "$all" => {
                let wanted = arg
                    .as_array()
                    .ok_or_else(|| invalid("$all requires an array"))?;
                wanted.iter().all(|w| eq_match(candidates, w))
            }
            other => return Err(invalid(format!("unknown query operator '{other}'"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(candidates: &[&Value], op: &str, arg: &Value) -> Result<bool, StoreError> {
    let list = arg
        .as_array()
        .ok_or_else(|| invalid(format!("{op} requires an array")))?;
    for item in list {
        let hit = match item {
            Value::Object(map) if map.contains_key("$regex") => {
                let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
                regex_match(candidates, &build_regex(&map["$regex"], options)?)
            }
            _ => eq_match(candidates, item),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn regex_match(candidates: &[&Value], re: &Regex) -> bool {
    flatten(candidates)
        .into_iter()
        .any(|c| c.as_str().is_some_and(|s| re.is_match(s)))
}

/// Compile a `$regex` pattern with Mongo-style `$options` (`i m s x`).
pub fn build_regex(pattern: &Value, options: &str) -> Result<Regex, StoreError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| invalid("$regex requires a string pattern"))?;
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            // JS-only flags carried over from RegExp literals.
            'g' | 'u' | 'y' | 'd' => &mut builder,
            other => return Err(invalid(format!("unsupported regex option '{other}'"))),
        };
    }
    builder
        .size_limit(1 << 20)
        .build()
        .map_err(|e| invalid(format!("invalid regex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> Value {
        json!({
            "_id": "u1",
            "name": "Ada Lovelace",
            "age": 36,
            "tags": ["math", "poetry"],
            "address": {"city": "London", "zip": null},
            "orders": [{"total": 10}, {"total": 25}]
        })
    }

    fn check(filter: Value) -> bool {
        matches(&user(), &filter).unwrap()
    }

    #[test]
    fn null_and_empty_filters_match_all() {
        assert!(check(Value::Null));
        assert!(check(json!({})));
    }

    #[test]
    fn implicit_equality_and_paths() {
        assert!(check(json!({"age": 36})));
        assert!(check(json!({"age": 36.0})));
        assert!(check(json!({"address.city": "London"})));
        assert!(!check(json!({"address.city": "Paris"})));
        assert!(check(json!({"tags": "math"})));
        assert!(check(json!({"tags": ["math", "poetry"]})));
        assert!(check(json!({"orders.total": 25})));
    }

    #[test]
    fn null_matches_missing_and_null() {
        assert!(check(json!({"address.zip": null})));
        assert!(check(json!({"nickname": null})));
        assert!(!check(json!({"name": null})));
    }

    #[test]
    fn comparison_operators() {
        assert!(check(json!({"age": {"$gt": 20}})));
        assert!(check(json!({"age": {"$gte": 36, "$lte": 36}})));
        assert!(!check(json!({"age": {"$lt": 36}})));
        assert!(check(json!({"orders.total": {"$gt": 20}})));
        assert!(!check(json!({"age": {"$gt": "20"}})));
        assert!(check(json!({"age": {"$ne": 30}})));
    }

    #[test]
    fn set_membership() {
        assert!(check(json!({"age": {"$in": [1, 36]}})));
        assert!(check(json!({"tags": {"$in": ["poetry"]}})));
        assert!(check(json!({"tags": {"$nin": ["chess"]}})));
        assert!(!check(json!({"age": {"$nin": [36]}})));
        assert!(check(json!({"tags": {"$all": ["math", "poetry"]}})));
        assert!(check(json!({"tags": {"$size": 2}})));
    }

    #[test]
    fn exists() {
        assert!(check(json!({"address.zip": {"$exists": true}})));
        assert!(check(json!({"nickname": {"$exists": false}})));
        assert!(!check(json!({"name": {"$exists": false}})));
    }

    #[test]
    fn regex_with_options() {
        assert!(check(json!({"name": {"$regex": "^ada", "$options": "i"}})));
        assert!(!check(json!({"name": {"$regex": "^ada"}})));
        assert!(check(json!({"tags": {"$regex": "^po"}})));
        assert!(check(json!({"name": {"$in": [{"$regex": "love", "$options": "i"}]}})));
    }

    #[test]
    fn logical_operators() {
        assert!(check(json!({"$or": [{"age": 1}, {"name": "Ada Lovelace"}]})));
        assert!(!check(json!({"$and": [{"age": 36}, {"name": "Grace"}]})));
        assert!(check(json!({"$nor": [{"age": 1}, {"age": 2}]})));
        assert!(check(json!({"age": {"$not": {"$lt": 18}}})));
    }

    #[test]
    fn literal_subdocument_equality() {
        assert!(check(json!({"address": {"city": "London", "zip": null}})));
        assert!(!check(json!({"address": {"city": "London"}})));
    }

    #[test]
    fn malformed_filters_are_invalid_commands() {
        for filter in [
            json!({"age": {"$bogus": 1}}),
            json!({"$where": "this.age > 1"}),
            json!({"$or": []}),
            json!({"age": {"$in": 36}}),
            json!({"name": {"$regex": "("}}),
            json!({"name": {"$options": "i"}}),
            json!("age > 3"),
        ] {
            let err = matches(&user(), &filter).unwrap_err();
            assert_eq!(err.code(), "INVALID_COMMAND", "{filter}");
        }
    }
}
