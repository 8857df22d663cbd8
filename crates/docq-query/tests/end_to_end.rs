//! The full pipeline with a canned completion, the V8 sandbox, and a seeded
//! in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use docq_completion::{CompletionError, CompletionRequest, CompletionService};
use docq_query::{QueryEngine, QueryError};
use docq_sandbox::{ExecutionPhase, PatternAcceptance, SandboxConfig, SchemaRegistry};
use docq_store::MemoryStore;
use serde_json::{json, Value};

/// Returns one fixed snippet and keeps the prompts it was sent.
struct CannedCompletion {
    snippet: String,
    prompts: Mutex<Vec<String>>,
}

impl CannedCompletion {
    fn new(snippet: &str) -> Arc<Self> {
        Arc::new(Self {
            snippet: snippet.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CompletionService for CannedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Vec<String>, CompletionError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(vec![format!("\n{}\n", self.snippet)])
    }
}

fn users() -> Value {
    json!([
        {"_id": "u1", "name": "Ada", "age": 36},
        {"_id": "u2", "name": "Bo", "age": 17},
        {"_id": "u3", "name": "Cy", "age": 52}
    ])
}

async fn store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::from_seed("default", json!({ "users": users() }))
            .await
            .unwrap(),
    )
}

fn schemas() -> SchemaRegistry {
    SchemaRegistry::new().with(
        "users",
        json!({"name": {"type": "String", "required": true}, "age": "Number"}),
    )
}

const FIND_ADULTS: &str = r#"const db = client.db();
const users = await db.collection("users").find({ age: { $gt: 20 } }).toArray();
return users;"#;

#[tokio::test]
async fn finds_users_older_than_twenty() {
    let completion = CannedCompletion::new(FIND_ADULTS);
    let engine = QueryEngine::builder(completion.clone(), store().await, schemas(), ["admin", "user"])
        .build();

    let result = engine
        .process_query("Find all users with age greater than 20", "admin")
        .await
        .unwrap();
    assert_eq!(
        result,
        json!([
            {"_id": "u1", "name": "Ada", "age": 36},
            {"_id": "u3", "name": "Cy", "age": 52}
        ])
    );

    let prompt = completion.last_prompt();
    assert!(prompt.contains("Find all users with age greater than 20"));
    assert!(prompt.contains("admin"));
    assert!(prompt.contains("admin, user"));
    assert!(prompt.contains("\"users\""));
}

#[tokio::test]
async fn restricted_response_is_a_normal_result() {
    let completion = CannedCompletion::new(
        r#"if (role !== "admin") {
    return { restricted: true, message: `role ${role} may not delete users` };
}
return await client.db().collection("users").deleteMany({});"#,
    );
    let store = store().await;
    let engine =
        QueryEngine::builder(completion, store.clone(), schemas(), ["admin", "user"]).build();

    let result = engine.process_query("Delete every user", "user").await.unwrap();
    assert_eq!(result["restricted"], true);
    assert_eq!(store.documents("default", "users").await.len(), 3);
}

#[tokio::test]
async fn inserts_through_schema_constructors() {
    let completion = CannedCompletion::new(
        r#"const user = new schemas.users({ name: "John", age: 30 });
const { insertedId } = await client.db().collection("users").insertOne(user);
return await client.db().collection("users").findOne({ _id: insertedId }, { projection: { _id: 0 } });"#,
    );
    let store = store().await;
    let engine = QueryEngine::builder(completion, store.clone(), schemas(), ["admin"]).build();

    let result = engine
        .process_query("Create a new user with name John and age 30", "admin")
        .await
        .unwrap();
    assert_eq!(result, json!({"name": "John", "age": 30}));
    assert_eq!(store.documents("default", "users").await.len(), 4);
}

#[tokio::test]
async fn syntax_errors_fail_in_the_compile_phase() {
    let engine = QueryEngine::builder(
        CannedCompletion::new("return { broken: ;"),
        store().await,
        schemas(),
        ["admin"],
    )
    .build();

    let err = engine.process_query("anything", "admin").await.unwrap_err();
    assert_eq!(err.phase(), Some(ExecutionPhase::Compile), "{err}");
    assert_eq!(err.code(), "COMPILE_ERROR");
}

#[tokio::test]
async fn thrown_errors_fail_in_the_run_phase() {
    let engine = QueryEngine::builder(
        CannedCompletion::new(r#"throw new Error("no such report");"#),
        store().await,
        schemas(),
        ["admin"],
    )
    .build();

    let err = engine.process_query("anything", "admin").await.unwrap_err();
    match err {
        QueryError::Execution { phase, message, .. } => {
            assert_eq!(phase, ExecutionPhase::Run);
            assert!(message.contains("no such report"), "{message}");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn runaway_snippets_time_out() {
    let engine = QueryEngine::builder(
        CannedCompletion::new("while (true) {}"),
        store().await,
        schemas(),
        ["admin"],
    )
    .sandbox_config(SandboxConfig {
        timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .build();

    let err = engine.process_query("spin", "admin").await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
}

#[tokio::test]
async fn strict_acceptance_rejects_before_running() {
    let store = store().await;
    let engine = QueryEngine::builder(
        CannedCompletion::new(
            r#"await client.db().collection("users").deleteMany({});
return fetch("https://example.com");"#,
        ),
        store.clone(),
        schemas(),
        ["admin"],
    )
    .acceptance(Arc::new(PatternAcceptance::default()))
    .build();

    let err = engine.process_query("anything", "admin").await.unwrap_err();
    assert!(matches!(err, QueryError::InvalidSnippet { .. }), "{err:?}");
    assert_eq!(store.documents("default", "users").await.len(), 3);
}
