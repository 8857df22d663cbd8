//! Prompt composition.
//!
//! [`compose`] is pure: the same query, role and configuration always yield
//! the same text.

use crate::QueryConfig;

/// Build the completion prompt for one query.
///
/// The sections appear in a fixed order: the task and the environment, the
/// role allow-list with the restricted-response rule, the schema registry,
/// the query and role, the database name, the domain notes, and the
/// formatting constraints.
pub fn compose(query: &str, role: &str, config: &QueryConfig) -> String {
    let roles = config.roles.join(", ");
    let schemas = config.schemas.to_json_string();
    let database = &config.database;
    let notes = &config.domain_notes;

    let mut prompt = String::with_capacity(2048 + schemas.len() + query.len());

    prompt.push_str(
        "Write a JavaScript snippet that carries out a database request.\n\
         The snippet runs inside an async function. A document-store client is \
         already present in that environment as `client`, and the database \
         helper module as `docdb`. Obtain a database with `client.db()` and a \
         collection with `db.collection(name)`; collections support find, \
         findOne, insertOne, insertMany, updateOne, updateMany, replaceOne, \
         deleteOne, deleteMany, countDocuments and distinct with MongoDB-style \
         filters and update operators.\n\n",
    );

    prompt.push_str(&format!(
        "Roles allowed: {roles}\n\
         Roles are plain text labels, not database objects. The snippet itself \
         must decide whether the role below may perform the request. If it may \
         not, return a restricted response object such as \
         {{ restricted: true, message: \"...\" }} instead of throwing.\n\n"
    ));

    prompt.push_str(&format!(
        "Schemas are available as `schemas`: {schemas}\n\
         Build new records with the schema constructors (for example \
         `new schemas.<name>({{ ... }})`), not with ad-hoc object literals. Use \
         only `schemas` and `client` to reach data.\n\n"
    ));

    prompt.push_str(&format!("The query is: {query}\nThe role is: {role}\n\n"));

    prompt.push_str(&format!(
        "Use the database named \"{database}\"; `client.db()` with no argument \
         already points at it.\n\n"
    ));

    prompt.push_str(&format!("Additional information about the data: {notes}\n\n"));

    prompt.push_str(
        "Formatting rules:\n\
         - Do not use import or export statements.\n\
         - Do not wrap the answer in markdown fences or add any explanation.\n\
         - The code must be directly embeddable in the body of an async function.\n\
         - If you define an inner async helper, call it with `await` and return its \
         result explicitly (for example `return await run();`).\n\
         - End with a return statement that yields the query result.\n",
    );

    prompt
}
