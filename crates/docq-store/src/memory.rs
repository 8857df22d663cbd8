//! In-memory [`DocumentStore`] with Mongo-style command semantics.
//!
//! Databases and collections spring into existence on first write. Documents
//! keep insertion order; every document carries an `_id`, assigned from
//! [`new_object_id`] when the caller does not supply one.
//!
//! Writes that touch several documents are computed on copies and committed
//! only when every document succeeds, so a failing `updateMany` or
//! `insertMany` leaves the collection unchanged.

use std::collections::HashMap;
use std::path::Path;

use docq_error::StoreError;
use docq_sandbox::command::new_object_id;
use docq_sandbox::{DocumentStore, FindOptions, StoreCommand, UpdateOptions};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::filter::matches;
use crate::query::shape_results;
use crate::seed::{self, SeedError};
use crate::update::{apply_update, upsert_seed};
use crate::value::{lookup, values_equal};

type Collections = HashMap<String, Vec<Value>>;

/// A process-local document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: RwLock<HashMap<String, Collections>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `database` is pre-populated from a seed value.
    pub async fn from_seed(database: &str, seed: Value) -> Result<Self, SeedError> {
        let store = Self::new();
        store.load_seed(database, seed).await?;
        Ok(store)
    }

    /// A store whose `database` is pre-populated from a JSON seed file.
    pub async fn from_seed_file(database: &str, path: &Path) -> Result<Self, SeedError> {
        Self::from_seed(database, seed::read_seed_file(path)?).await
    }

    /// Insert every collection of `seed` into `database`.
    pub async fn load_seed(&self, database: &str, seed: Value) -> Result<(), SeedError> {
        for (collection, documents) in seed::collections(seed)? {
            let count = documents.len();
            self.insert_many(database, &collection, documents).await?;
            debug!(database, collection = %collection, count, "seeded collection");
        }
        Ok(())
    }

    /// A copy of every document in a collection, in insertion order.
    pub async fn documents(&self, database: &str, collection: &str) -> Vec<Value> {
        self.databases
            .read()
            .await
            .get(database)
            .and_then(|db| db.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let guard = self.databases.read().await;
        let mut hits = Vec::new();
        if let Some(docs) = guard.get(database).and_then(|db| db.get(collection)) {
            for doc in docs {
                if matches(doc, filter)? {
                    hits.push(doc.clone());
                }
            }
        }
        shape_results(hits, options)
    }

    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut prepared = Vec::with_capacity(documents.len());
        for document in documents {
            prepared.push(with_id(document)?);
        }

        let mut guard = self.databases.write().await;
        let docs = guard
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        for (i, doc) in prepared.iter().enumerate() {
            let id = &doc["_id"];
            let taken = docs.iter().any(|d| values_equal(&d["_id"], id))
                || prepared[..i].iter().any(|d| values_equal(&d["_id"], id));
            if taken {
                return Err(duplicate(collection, id));
            }
        }

        let ids = prepared.iter().map(|d| d["_id"].clone()).collect();
        docs.extend(prepared);
        Ok(ids)
    }

    async fn update(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        change: Change<'_>,
        multi: bool,
        options: &UpdateOptions,
    ) -> Result<Value, StoreError> {
        let mut guard = self.databases.write().await;
        let docs = guard
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        let mut staged = Vec::new();
        for (index, doc) in docs.iter().enumerate() {
            if !matches(doc, filter)? {
                continue;
            }
            let mut next = doc.clone();
            let modified = change.apply(&mut next)?;
            staged.push((index, next, modified));
            if !multi {
                break;
            }
        }

        if staged.is_empty() && options.upsert {
            let mut doc = upsert_seed(filter)?;
            change.apply(&mut doc)?;
            let doc = with_id(doc)?;
            let id = doc["_id"].clone();
            if docs.iter().any(|d| values_equal(&d["_id"], &id)) {
                return Err(duplicate(collection, &id));
            }
            docs.push(doc);
            return Ok(json!({
                "acknowledged": true,
                "matchedCount": 0,
                "modifiedCount": 0,
                "upsertedCount": 1,
                "upsertedId": id,
            }));
        }

        let matched = staged.len();
        let mut modified = 0;
        for (index, next, changed) in staged {
            if changed {
                docs[index] = next;
                modified += 1;
            }
        }
        Ok(json!({
            "acknowledged": true,
            "matchedCount": matched,
            "modifiedCount": modified,
            "upsertedCount": 0,
            "upsertedId": null,
        }))
    }

    async fn delete(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        multi: bool,
    ) -> Result<u64, StoreError> {
        let mut guard = self.databases.write().await;
        let Some(docs) = guard.get_mut(database).and_then(|db| db.get_mut(collection)) else {
            return Ok(0);
        };

        let mut doomed = Vec::new();
        for (index, doc) in docs.iter().enumerate() {
            if matches(doc, filter)? {
                doomed.push(index);
                if !multi {
                    break;
                }
            }
        }
        for index in doomed.iter().rev() {
            docs.remove(*index);
        }
        Ok(doomed.len() as u64)
    }

    async fn distinct(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, StoreError> {
        let matching = self
            .find(database, collection, filter, &FindOptions::default())
            .await?;
        let mut seen: Vec<Value> = Vec::new();
        for doc in &matching {
            for value in lookup(doc, field) {
                let items: Vec<&Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                for item in items {
                    if !seen.iter().any(|s| values_equal(s, item)) {
                        seen.push(item.clone());
                    }
                }
            }
        }
        Ok(seen)
    }
}

/// The two ways an update-family command rewrites a matched document.
#[derive(Clone, Copy)]
enum Change<'a> {
    Update(&'a Value),
    Replace(&'a Value),
}

impl Change<'_> {
    fn apply(&self, doc: &mut Value) -> Result<bool, StoreError> {
        match self {
            Change::Update(update) => apply_update(doc, update),
            Change::Replace(replacement) => replace(doc, replacement),
        }
    }
}

fn replace(doc: &mut Value, replacement: &Value) -> Result<bool, StoreError> {
    let Value::Object(fields) = replacement else {
        return Err(StoreError::InvalidCommand(
            "replacement must be an object".into(),
        ));
    };
    if fields.keys().any(|k| k.starts_with('$')) {
        return Err(StoreError::InvalidCommand(
            "replacement document must not contain update operators".into(),
        ));
    }

    let current_id = doc.get("_id").cloned();
    if let (Some(current), Some(requested)) = (&current_id, fields.get("_id")) {
        if !values_equal(current, requested) {
            return Err(StoreError::InvalidCommand("_id is immutable".into()));
        }
    }

    let mut next = Map::new();
    if let Some(id) = current_id.or_else(|| fields.get("_id").cloned()) {
        next.insert("_id".to_string(), id);
    }
    for (k, v) in fields {
        if k != "_id" {
            next.insert(k.clone(), v.clone());
        }
    }
    let next = Value::Object(next);
    let changed = !values_equal(doc, &next);
    *doc = next;
    Ok(changed)
}

fn with_id(document: Value) -> Result<Value, StoreError> {
    let Value::Object(mut map) = document else {
        return Err(StoreError::InvalidCommand(
            "document must be an object".into(),
        ));
    };
    if !map.contains_key("_id") || map["_id"].is_null() {
        map.insert("_id".to_string(), Value::String(new_object_id()));
    }
    Ok(Value::Object(map))
}

fn duplicate(collection: &str, id: &Value) -> StoreError {
    StoreError::DuplicateKey {
        collection: collection.to_string(),
        id: match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn execute(
        &self,
        database: &str,
        collection: &str,
        command: StoreCommand,
    ) -> Result<Value, StoreError> {
        debug!(database, collection, op = command.op_name(), "memory store command");
        match command {
            StoreCommand::Find { filter, options } => Ok(Value::Array(
                self.find(database, collection, &filter, &options).await?,
            )),
            StoreCommand::FindOne { filter, options } => {
                let options = FindOptions {
                    limit: Some(1),
                    ..options
                };
                let mut hits = self.find(database, collection, &filter, &options).await?;
                Ok(if hits.is_empty() {
                    Value::Null
                } else {
                    hits.swap_remove(0)
                })
            }
            StoreCommand::InsertOne { document } => {
                let ids = self.insert_many(database, collection, vec![document]).await?;
                Ok(json!({
                    "acknowledged": true,
                    "insertedId": ids.into_iter().next().unwrap_or(Value::Null),
                }))
            }
            StoreCommand::InsertMany { documents } => {
                if documents.is_empty() {
                    return Err(StoreError::InvalidCommand(
                        "insertMany requires at least one document".into(),
                    ));
                }
                let ids = self.insert_many(database, collection, documents).await?;
                let inserted_ids: Map<String, Value> = ids
                    .into_iter()
                    .enumerate()
                    .map(|(i, id)| (i.to_string(), id))
                    .collect();
                Ok(json!({
                    "acknowledged": true,
                    "insertedCount": inserted_ids.len(),
                    "insertedIds": inserted_ids,
                }))
            }
            StoreCommand::UpdateOne {
                filter,
                update,
                options,
            } => {
                self.update(database, collection, &filter, Change::Update(&update), false, &options)
                    .await
            }
            StoreCommand::UpdateMany {
                filter,
                update,
                options,
            } => {
                self.update(database, collection, &filter, Change::Update(&update), true, &options)
                    .await
            }
            StoreCommand::ReplaceOne {
                filter,
                replacement,
                options,
            } => {
                self.update(
                    database,
                    collection,
                    &filter,
                    Change::Replace(&replacement),
                    false,
                    &options,
                )
                .await
            }
            StoreCommand::DeleteOne { filter } => {
                let deleted = self.delete(database, collection, &filter, false).await?;
                Ok(json!({"acknowledged": true, "deletedCount": deleted}))
            }
            StoreCommand::DeleteMany { filter } => {
                let deleted = self.delete(database, collection, &filter, true).await?;
                Ok(json!({"acknowledged": true, "deletedCount": deleted}))
            }
            StoreCommand::CountDocuments { filter } => {
                let hits = self
                    .find(database, collection, &filter, &FindOptions::default())
                    .await?;
                Ok(json!(hits.len()))
            }
            StoreCommand::Distinct { field, filter } => Ok(Value::Array(
                self.distinct(database, collection, &field, &filter).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryStore {
        MemoryStore::from_seed(
            "default",
            json!({
                "users": [
                    {"_id": "u1", "name": "Ada", "age": 36, "tags": ["math"]},
                    {"_id": "u2", "name": "Bo", "age": 17, "tags": ["art", "math"]},
                    {"_id": "u3", "name": "Cy", "age": 52}
                ]
            }),
        )
        .await
        .unwrap()
    }

    async fn exec(store: &MemoryStore, command: Value) -> Result<Value, StoreError> {
        let command: StoreCommand = serde_json::from_value(command).unwrap();
        store.execute("default", "users", command).await
    }

    #[tokio::test]
    async fn find_filters_sorts_and_projects() {
        let store = seeded().await;
        let result = exec(
            &store,
            json!({
                "op": "find",
                "filter": {"age": {"$gt": 20}},
                "options": {"sort": {"age": -1}, "projection": {"name": 1, "_id": 0}}
            }),
        )
        .await
        .unwrap();
        assert_eq!(result, json!([{"name": "Cy"}, {"name": "Ada"}]));
    }

    #[tokio::test]
    async fn find_one_returns_null_when_nothing_matches() {
        let store = seeded().await;
        let hit = exec(&store, json!({"op": "findOne", "filter": {"name": "Bo"}}))
            .await
            .unwrap();
        assert_eq!(hit["_id"], "u2");
        let miss = exec(&store, json!({"op": "findOne", "filter": {"name": "Zed"}}))
            .await
            .unwrap();
        assert_eq!(miss, Value::Null);
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_rejects_duplicates() {
        let store = seeded().await;
        let result = exec(&store, json!({"op": "insertOne", "document": {"name": "Di"}}))
            .await
            .unwrap();
        let id = result["insertedId"].as_str().unwrap();
        assert!(docq_sandbox::command::is_object_id(id));

        let err = exec(&store, json!({"op": "insertOne", "document": {"_id": "u1"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn insert_many_is_all_or_nothing() {
        let store = seeded().await;
        let err = exec(
            &store,
            json!({"op": "insertMany", "documents": [{"_id": "n1"}, {"_id": "u2"}]}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_KEY");
        assert_eq!(store.documents("default", "users").await.len(), 3);

        let ok = exec(
            &store,
            json!({"op": "insertMany", "documents": [{"_id": "n1"}, {"name": "x"}]}),
        )
        .await
        .unwrap();
        assert_eq!(ok["insertedCount"], 2);
        assert_eq!(ok["insertedIds"]["0"], "n1");
    }

    #[tokio::test]
    async fn update_many_counts_matches_and_modifications() {
        let store = seeded().await;
        let result = exec(
            &store,
            json!({"op": "updateMany", "filter": {"tags": "math"}, "update": {"$set": {"age": 36}}}),
        )
        .await
        .unwrap();
        assert_eq!(result["matchedCount"], 2);
        assert_eq!(result["modifiedCount"], 1);
    }

    #[tokio::test]
    async fn failed_update_many_leaves_documents_untouched() {
        let store = seeded().await;
        let before = store.documents("default", "users").await;
        let err = exec(
            &store,
            json!({"op": "updateMany", "filter": {}, "update": {"$inc": {"name": 1}}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
        assert_eq!(store.documents("default", "users").await, before);
    }

    #[tokio::test]
    async fn upsert_seeds_from_filter() {
        let store = seeded().await;
        let result = exec(
            &store,
            json!({
                "op": "updateOne",
                "filter": {"name": "Eve"},
                "update": {"$set": {"age": 29}},
                "options": {"upsert": true}
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["upsertedCount"], 1);
        let eve = exec(&store, json!({"op": "findOne", "filter": {"name": "Eve"}}))
            .await
            .unwrap();
        assert_eq!(eve["age"], 29);
        assert_eq!(eve["_id"], result["upsertedId"]);
    }

    #[tokio::test]
    async fn replace_keeps_id() {
        let store = seeded().await;
        exec(
            &store,
            json!({"op": "replaceOne", "filter": {"_id": "u3"}, "replacement": {"name": "Cyrus"}}),
        )
        .await
        .unwrap();
        let doc = exec(&store, json!({"op": "findOne", "filter": {"_id": "u3"}}))
            .await
            .unwrap();
        assert_eq!(doc, json!({"_id": "u3", "name": "Cyrus"}));

        let err = exec(
            &store,
            json!({"op": "replaceOne", "filter": {"_id": "u3"}, "replacement": {"$set": {"a": 1}}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
    }

    #[tokio::test]
    async fn delete_count_and_distinct() {
        let store = seeded().await;
        let tags = exec(&store, json!({"op": "distinct", "field": "tags"}))
            .await
            .unwrap();
        assert_eq!(tags, json!(["math", "art"]));

        let deleted = exec(&store, json!({"op": "deleteMany", "filter": {"age": {"$lt": 40}}}))
            .await
            .unwrap();
        assert_eq!(deleted["deletedCount"], 2);
        let count = exec(&store, json!({"op": "countDocuments"})).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unknown_collections_are_empty() {
        let store = MemoryStore::new();
        let command = StoreCommand::Find {
            filter: Value::Null,
            options: FindOptions::default(),
        };
        assert_eq!(
            store.execute("other", "nothing", command).await.unwrap(),
            json!([])
        );
    }
}
