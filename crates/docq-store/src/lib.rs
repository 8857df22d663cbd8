//! # docq-store
//!
//! A process-local [`DocumentStore`](docq_sandbox::DocumentStore) with
//! Mongo-style semantics, used by the CLI and by tests that need a real
//! database behind the `client` binding.
//!
//! ```no_run
//! # async fn demo() -> Result<(), docq_store::SeedError> {
//! let store = docq_store::MemoryStore::from_seed(
//!     "default",
//!     serde_json::json!({ "users": [{ "name": "Ada", "age": 36 }] }),
//! )
//! .await?;
//! # let _ = store;
//! # Ok(())
//! # }
//! ```

pub mod filter;
pub mod memory;
pub mod query;
pub mod seed;
pub mod update;
pub mod value;

pub use memory::MemoryStore;
pub use seed::SeedError;
