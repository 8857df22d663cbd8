//! Database commands issued by snippet code through the `client` binding.
//!
//! The JavaScript collection API serializes every call into one of these
//! commands (`{"op": "find", "filter": {...}, ...}`) and hands it to the
//! [`DocumentStore`](crate::DocumentStore) behind the binding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Options accepted by `find` and `findOne`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FindOptions {
    /// Sort specification, e.g. `{"age": -1, "name": 1}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Map<String, Value>>,
    /// Maximum number of documents to return (0 means no limit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Number of matching documents to skip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    /// Field projection, inclusion (`1`) or exclusion (`0`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Map<String, Value>>,
}

/// Options accepted by the update family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateOptions {
    /// Insert a new document when nothing matches.
    pub upsert: bool,
}

/// A single database command against one collection.
///
/// A `null` or absent filter matches every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StoreCommand {
    /// Return all matching documents.
    Find {
        /// Query filter.
        #[serde(default)]
        filter: Value,
        /// Sort, paging and projection.
        #[serde(default)]
        options: FindOptions,
    },
    /// Return the first matching document, or `null`.
    FindOne {
        /// Query filter.
        #[serde(default)]
        filter: Value,
        /// Sort, paging and projection.
        #[serde(default)]
        options: FindOptions,
    },
    /// Insert one document.
    InsertOne {
        /// The document to insert.
        document: Value,
    },
    /// Insert several documents.
    InsertMany {
        /// The documents to insert.
        documents: Vec<Value>,
    },
    /// Apply an update document to the first match.
    UpdateOne {
        /// Query filter.
        #[serde(default)]
        filter: Value,
        /// Update operators or replacement fields.
        update: Value,
        /// Upsert behaviour.
        #[serde(default)]
        options: UpdateOptions,
    },
    /// Apply an update document to every match.
    UpdateMany {
        /// Query filter.
        #[serde(default)]
        filter: Value,
        /// Update operators or replacement fields.
        update: Value,
        /// Upsert behaviour.
        #[serde(default)]
        options: UpdateOptions,
    },
    /// Replace the first match, keeping its `_id`.
    ReplaceOne {
        /// Query filter.
        #[serde(default)]
        filter: Value,
        /// The replacement document.
        replacement: Value,
        /// Upsert behaviour.
        #[serde(default)]
        options: UpdateOptions,
    },
    /// Delete the first match.
    DeleteOne {
        /// Query filter.
        #[serde(default)]
        filter: Value,
    },
    /// Delete every match.
    DeleteMany {
        /// Query filter.
        #[serde(default)]
        filter: Value,
    },
    /// Count matching documents.
    CountDocuments {
        /// Query filter.
        #[serde(default)]
        filter: Value,
    },
    /// Distinct values of a field among matching documents.
    Distinct {
        /// Dotted field path.
        field: String,
        /// Query filter.
        #[serde(default)]
        filter: Value,
    },
}

impl StoreCommand {
    /// The wire name of the operation (`"find"`, `"insertOne"`, ...).
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::FindOne { .. } => "findOne",
            Self::InsertOne { .. } => "insertOne",
            Self::InsertMany { .. } => "insertMany",
            Self::UpdateOne { .. } => "updateOne",
            Self::UpdateMany { .. } => "updateMany",
            Self::ReplaceOne { .. } => "replaceOne",
            Self::DeleteOne { .. } => "deleteOne",
            Self::DeleteMany { .. } => "deleteMany",
            Self::CountDocuments { .. } => "countDocuments",
            Self::Distinct { .. } => "distinct",
        }
    }

    /// Whether the command can mutate the store.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Self::Find { .. }
                | Self::FindOne { .. }
                | Self::CountDocuments { .. }
                | Self::Distinct { .. }
        )
    }
}

/// Generate a fresh 24-hex-character document identifier.
pub fn new_object_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

/// Whether `value` has the shape of an identifier from [`new_object_id`].
pub fn is_object_id(value: &str) -> bool {
    value.len() == 24 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_find_with_options() {
        let cmd: StoreCommand = serde_json::from_value(json!({
            "op": "find",
            "filter": {"age": {"$gt": 20}},
            "options": {"sort": {"age": -1}, "limit": 5}
        }))
        .unwrap();
        match cmd {
            StoreCommand::Find { filter, options } => {
                assert_eq!(filter, json!({"age": {"$gt": 20}}));
                assert_eq!(options.limit, Some(5));
                assert_eq!(options.sort.unwrap()["age"], -1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn missing_filter_defaults_to_null() {
        let cmd: StoreCommand = serde_json::from_value(json!({"op": "countDocuments"})).unwrap();
        assert_eq!(cmd, StoreCommand::CountDocuments { filter: Value::Null });
    }

    #[test]
    fn camel_case_op_names_round_trip() {
        let cmd: StoreCommand = serde_json::from_value(json!({
            "op": "updateMany",
            "filter": {},
            "update": {"$set": {"active": false}},
            "options": {"upsert": true}
        }))
        .unwrap();
        assert_eq!(cmd.op_name(), "updateMany");
        assert!(cmd.is_write());
        let back = serde_json::to_value(&cmd).unwrap();
        assert_eq!(back["op"], "updateMany");
        assert_eq!(back["options"]["upsert"], true);
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = serde_json::from_value::<StoreCommand>(json!({"op": "dropDatabase"}));
        assert!(err.is_err());
    }

    #[test]
    fn reads_are_not_writes() {
        let cmd = StoreCommand::Distinct {
            field: "role".into(),
            filter: Value::Null,
        };
        assert!(!cmd.is_write());
    }

    #[test]
    fn object_ids_have_expected_shape() {
        let id = new_object_id();
        assert!(is_object_id(&id), "bad id: {id}");
        assert_ne!(id, new_object_id());
        assert!(!is_object_id("not-an-id"));
    }
}
