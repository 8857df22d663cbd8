//! Seed data: `{ "collection": [documents...] }` loaded into one database.

use std::path::{Path, PathBuf};

use docq_error::StoreError;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while loading seed data.
#[derive(Debug, Error)]
pub enum SeedError {
    /// The seed file could not be read.
    #[error("failed to read seed file {path}: {source}")]
    Io {
        /// Path of the seed file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The seed file is not valid JSON.
    #[error("failed to parse seed data: {0}")]
    Parse(#[from] serde_json::Error),

    /// The JSON is valid but not `{ collection: [documents] }`.
    #[error("invalid seed data: {0}")]
    Shape(String),

    /// A document was rejected by the store.
    #[error("failed to insert seed document: {0}")]
    Store(#[from] StoreError),
}

/// Split a seed value into `(collection, documents)` pairs.
pub fn collections(seed: Value) -> Result<Vec<(String, Vec<Value>)>, SeedError> {
    let Value::Object(map) = seed else {
        return Err(SeedError::Shape(
            "top level must be an object of collections".into(),
        ));
    };
    map.into_iter()
        .map(|(collection, docs)| match docs {
            Value::Array(docs) => {
                if let Some(bad) = docs.iter().position(|d| !d.is_object()) {
                    return Err(SeedError::Shape(format!(
                        "{collection}[{bad}] is not a document"
                    )));
                }
                Ok((collection, docs))
            }
            _ => Err(SeedError::Shape(format!(
                "collection '{collection}' must be an array of documents"
            ))),
        })
        .collect()
}

/// Read and parse a seed file.
pub fn read_seed_file(path: &Path) -> Result<Value, SeedError> {
    let text = std::fs::read_to_string(path).map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}
