//! The execution binding set: the only identifiers a snippet can use to reach
//! live resources.
//!
//! A [`BindingSet`] is built fresh for every run and consumed by it. It holds
//! exactly four bindings, exposed to JavaScript under fixed names:
//!
//! | Rust field | JS global | What it is |
//! |------------|-----------|------------|
//! | `module`   | `docdb`   | client-side helper library (ids, error types) |
//! | `handle`   | `client`  | database handle routed to a [`DocumentStore`] |
//! | `schemas`  | `schemas` | schema registry, one constructor per entry |
//! | `role`     | `role`    | the caller's role string |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DocumentStore;

/// JS name of the database module binding.
pub const MODULE_BINDING: &str = "docdb";
/// JS name of the database handle binding.
pub const HANDLE_BINDING: &str = "client";
/// JS name of the schema registry binding.
pub const SCHEMAS_BINDING: &str = "schemas";
/// JS name of the role binding.
pub const ROLE_BINDING: &str = "role";

/// Mapping from logical entity name to its structural definition.
///
/// Definitions are opaque JSON. The sandbox understands the
/// `{ field: { type, required, default } }` shape (or a bare type string per
/// field) and passes anything else through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaRegistry(BTreeMap<String, Value>);

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a JSON object of `name → definition`.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Add (or replace) a schema.
    pub fn insert(&mut self, name: impl Into<String>, definition: Value) -> &mut Self {
        self.0.insert(name.into(), definition);
        self
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, definition: Value) -> Self {
        self.insert(name, definition);
        self
    }

    /// Look up a schema definition.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Schema names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of schemas.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize the registry as a compact JSON object.
    pub fn to_json_string(&self) -> String {
        // A BTreeMap<String, Value> always serializes.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// The client-side database helper library exposed as `docdb`.
///
/// Stateless: `docdb.ObjectId()`, `docdb.isValidObjectId()` and the
/// `docdb.ValidationError` class are defined inside the isolate. The type
/// exists so the binding set names every capability explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseModule;

/// Live database handle exposed as `client`.
///
/// `client.db()` without an argument targets `database`.
#[derive(Clone)]
pub struct DatabaseHandle {
    /// The store every collection call is routed to.
    pub store: Arc<dyn DocumentStore>,
    /// Default database name.
    pub database: String,
}

impl DatabaseHandle {
    /// Wrap a store with a default database name.
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>) -> Self {
        Self {
            store,
            database: database.into(),
        }
    }
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Everything one sandbox run may touch.
#[derive(Debug, Clone)]
pub struct BindingSet {
    /// `docdb`
    pub module: DatabaseModule,
    /// `client`
    pub handle: DatabaseHandle,
    /// `schemas`
    pub schemas: SchemaRegistry,
    /// `role`
    pub role: String,
}

impl BindingSet {
    /// Assemble a binding set for one run.
    pub fn new(handle: DatabaseHandle, schemas: SchemaRegistry, role: impl Into<String>) -> Self {
        Self {
            module: DatabaseModule,
            handle,
            schemas,
            role: role.into(),
        }
    }

    /// The JS identifiers this set installs, in installation order.
    pub fn names(&self) -> [&'static str; 4] {
        [MODULE_BINDING, HANDLE_BINDING, SCHEMAS_BINDING, ROLE_BINDING]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_from_json_object() {
        let reg = SchemaRegistry::from_json(json!({
            "users": {"name": "String", "age": "Number"},
            "orders": {"total": "Number"}
        }))
        .unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["orders", "users"]);
        assert_eq!(reg.get("users").unwrap()["age"], "Number");
    }

    #[test]
    fn registry_rejects_non_object() {
        assert!(SchemaRegistry::from_json(json!(["users"])).is_err());
    }

    #[test]
    fn registry_serializes_transparently() {
        let reg = SchemaRegistry::new().with("users", json!({"name": "String"}));
        assert_eq!(reg.to_json_string(), r#"{"users":{"name":"String"}}"#);
    }
}
