//! Result shaping for `find`: sort, skip, limit and projection.

use std::cmp::Ordering;

use docq_error::StoreError;
use docq_sandbox::FindOptions;
use serde_json::{Map, Value};

use crate::value::{first, parent_mut, remove_child, set_child, total_cmp};

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidCommand(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

fn direction(field: &str, value: &Value) -> Result<Direction, StoreError> {
    match value {
        Value::Number(n) if n.as_f64() == Some(1.0) => Ok(Direction::Ascending),
        Value::Number(n) if n.as_f64() == Some(-1.0) => Ok(Direction::Descending),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Direction::Ascending),
            "desc" | "descending" => Ok(Direction::Descending),
            _ => Err(invalid(format!("invalid sort direction for '{field}': {s}"))),
        },
        other => Err(invalid(format!("invalid sort direction for '{field}': {other}"))),
    }
}

/// Stable sort by a `{field: 1 | -1}` specification. Missing fields sort as
/// `null`.
pub fn sort_documents(docs: &mut [Value], spec: &Map<String, Value>) -> Result<(), StoreError> {
    let keys = spec
        .iter()
        .map(|(field, dir)| Ok((field.as_str(), direction(field, dir)?)))
        .collect::<Result<Vec<_>, StoreError>>()?;
    if keys.is_empty() {
        return Ok(());
    }

    docs.sort_by(|a, b| {
        for (field, dir) in &keys {
            let left = first(a, field).unwrap_or(&Value::Null);
            let right = first(b, field).unwrap_or(&Value::Null);
            let ord = match dir {
                Direction::Ascending => total_cmp(left, right),
                Direction::Descending => total_cmp(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn flag(field: &str, value: &Value) -> Result<bool, StoreError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64() != Some(0.0)),
        other => Err(invalid(format!(
            "projection value for '{field}' must be 0 or 1, got {other}"
        ))),
    }
}

/// A parsed projection: either the fields to keep or the fields to drop.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    include: bool,
    fields: Vec<String>,
    keep_id: bool,
}

impl Projection {
    /// Parse `{field: 0 | 1}`. Inclusion and exclusion cannot be mixed,
    /// except for `_id`, which is kept unless excluded explicitly.
    pub fn parse(spec: &Map<String, Value>) -> Result<Option<Self>, StoreError> {
        let mut keep_id = true;
        let mut include = None;
        let mut fields = Vec::new();

        for (field, value) in spec {
            let on = flag(field, value)?;
            if field == "_id" {
                keep_id = on;
                continue;
            }
            match include {
                None => include = Some(on),
                Some(mode) if mode != on => {
                    return Err(invalid("projection cannot mix inclusion and exclusion"))
                }
                Some(_) => {}
            }
            fields.push(field.clone());
        }

        Ok(match include {
            Some(include) => Some(Self {
                include,
                fields,
                keep_id,
            }),
            None if !keep_id => Some(Self {
                include: false,
                fields: Vec::new(),
                keep_id,
            }),
            None => None,
        })
    }

    /// Shape one document.
    pub fn apply(&self, doc: &Value) -> Result<Value, StoreError> {
        let mut out = if self.include {
            let mut shaped = Value::Object(Map::new());
            for field in &self.fields {
                if let Some(value) = first(doc, field) {
                    let (parent, key) = parent_mut(&mut shaped, field, true)
                        .map_err(invalid)?
                        .ok_or_else(|| invalid(format!("cannot project '{field}'")))?;
                    set_child(parent, &key, value.clone()).map_err(invalid)?;
                }
            }
            if self.keep_id {
                if let (Some(id), Value::Object(map)) = (doc.get("_id"), &mut shaped) {
                    map.insert("_id".to_string(), id.clone());
                }
            }
            shaped
        } else {
            let mut shaped = doc.clone();
            for field in &self.fields {
                if let Some((parent, key)) = parent_mut(&mut shaped, field, false).map_err(invalid)? {
                    remove_child(parent, &key);
                }
            }
            shaped
        };

        if !self.keep_id {
            if let Value::Object(map) = &mut out {
                map.remove("_id");
            }
        }
        Ok(out)
    }
}

/// Sort, page and project an already-filtered result set.
pub fn shape_results(mut docs: Vec<Value>, options: &FindOptions) -> Result<Vec<Value>, StoreError> {
    let projection = match &options.projection {
        Some(spec) => Projection::parse(spec)?,
        None => None,
    };
    if let Some(spec) = &options.sort {
        sort_documents(&mut docs, spec)?;
    }

    let skip = usize::try_from(options.skip.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = match options.limit {
        None | Some(0) => usize::MAX,
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
    };

    docs.into_iter()
        .skip(skip)
        .take(limit)
        .map(|doc| match &projection {
            Some(p) => p.apply(&doc),
            None => Ok(doc),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Vec<Value> {
        vec![
            json!({"_id": 1, "name": "Cy", "age": 40, "city": {"name": "Oslo"}}),
            json!({"_id": 2, "name": "Ada", "age": 36, "city": {"name": "London"}}),
            json!({"_id": 3, "name": "Bo"}),
            json!({"_id": 4, "name": "Di", "age": 36, "city": {"name": "Paris"}}),
        ]
    }

    fn ids(docs: &[Value]) -> Vec<i64> {
        docs.iter().map(|d| d["_id"].as_i64().unwrap()).collect()
    }

    fn spec(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn sorts_stably_with_missing_fields_first() {
        let mut docs = people();
        sort_documents(&mut docs, &spec(json!({"age": 1}))).unwrap();
        assert_eq!(ids(&docs), vec![3, 2, 4, 1]);

        sort_documents(&mut docs, &spec(json!({"age": -1, "name": "desc"}))).unwrap();
        assert_eq!(ids(&docs), vec![1, 4, 2, 3]);
    }

    #[test]
    fn rejects_bad_sort_direction() {
        let mut docs = people();
        assert!(sort_documents(&mut docs, &spec(json!({"age": 2}))).is_err());
    }

    #[test]
    fn inclusion_projection_keeps_id_and_nested_paths() {
        let p = Projection::parse(&spec(json!({"name": 1, "city.name": 1})))
            .unwrap()
            .unwrap();
        assert_eq!(
            p.apply(&people()[0]).unwrap(),
            json!({"_id": 1, "name": "Cy", "city": {"name": "Oslo"}})
        );
    }

    #[test]
    fn exclusion_projection_and_id_suppression() {
        let p = Projection::parse(&spec(json!({"city": 0, "_id": 0})))
            .unwrap()
            .unwrap();
        assert_eq!(p.apply(&people()[1]).unwrap(), json!({"name": "Ada", "age": 36}));

        let only_id = Projection::parse(&spec(json!({"_id": 0}))).unwrap().unwrap();
        assert_eq!(only_id.apply(&json!({"_id": 9, "a": 1})).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn mixed_projection_is_invalid() {
        let err = Projection::parse(&spec(json!({"name": 1, "age": 0}))).unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
    }

    #[test]
    fn skip_and_limit_after_sort() {
        let options = FindOptions {
            sort: Some(spec(json!({"_id": -1}))),
            skip: Some(1),
            limit: Some(2),
            projection: None,
        };
        let docs = shape_results(people(), &options).unwrap();
        assert_eq!(ids(&docs), vec![3, 2]);
    }

    #[test]
    fn zero_limit_means_unbounded() {
        let options = FindOptions {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(shape_results(people(), &options).unwrap().len(), 4);
    }
}
