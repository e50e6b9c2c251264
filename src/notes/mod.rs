//! The note service the bridge searches and reads from.

pub mod memory;
pub mod query;
pub mod rest;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;

use crate::error::QueryError;

pub use memory::MemoryNoteService;
pub use query::Query;
pub use rest::RestNoteService;

/// One note matched by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub filename: String,
    #[serde(default)]
    pub result: Value,
}

impl SearchHit {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            result: Value::Bool(true),
        }
    }
}

/// Per-note details, fetched only for direct matches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NoteMetadata {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub frontmatter: Map<String, Value>,
    pub path: String,
    #[serde(default)]
    pub content: String,
}

impl NoteMetadata {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.frontmatter.get(key)
    }
}

/// Search and read access to a vault of markdown notes.
pub trait NoteService: Send + Sync + 'static {
    fn search(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<SearchHit>, QueryError>> + Send;

    fn fetch_note(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<NoteMetadata, QueryError>> + Send;
}
