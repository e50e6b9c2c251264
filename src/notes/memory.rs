use log::warn;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{OnceLock, RwLock};

use super::{NoteMetadata, NoteService, Query, SearchHit};
use crate::error::QueryError;

/// An in-process vault: markdown files keyed by vault path. Queries are
/// evaluated locally with the same semantics the remote service applies.
#[derive(Debug, Default)]
pub struct MemoryNoteService {
    notes: RwLock<BTreeMap<String, String>>,
}

impl MemoryNoteService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notes<I, P, C>(notes: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let service = Self::new();
        for (path, content) in notes {
            service.insert(path, content);
        }
        service
    }

    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        self.notes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), content.into());
    }

    pub fn remove(&self, path: &str) -> bool {
        self.notes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.notes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn search_now(&self, query: &Query) -> Result<Vec<SearchHit>, QueryError> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        let mut hits = Vec::new();
        for (path, content) in notes.iter() {
            let meta = parse_note(path, content);
            let document = json!({
                "path": meta.path,
                "content": meta.content,
                "frontmatter": meta.frontmatter,
                "tags": meta.tags,
            });
            if query.matches(&document)? {
                hits.push(SearchHit::new(path.clone()));
            }
        }
        Ok(hits)
    }

    fn fetch_now(&self, path: &str) -> Result<NoteMetadata, QueryError> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        notes
            .get(path)
            .map(|content| parse_note(path, content))
            .ok_or_else(|| QueryError::Status {
                status: 404,
                message: format!("File not found: {}", path),
            })
    }
}

impl NoteService for MemoryNoteService {
    async fn search(&self, query: &Query) -> Result<Vec<SearchHit>, QueryError> {
        self.search_now(query)
    }

    async fn fetch_note(&self, path: &str) -> Result<NoteMetadata, QueryError> {
        self.fetch_now(path)
    }
}

/// Split YAML frontmatter from a markdown body. Returns `(yaml, body)`, or
/// `None` when the note has no frontmatter block. The closing fence is the
/// first line that is exactly `---`; a line such as `----` or `--- x` is part
/// of the YAML.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let after_first = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in after_first.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let yaml = after_first[..offset]
                .strip_suffix('\n')
                .map(|yaml| yaml.strip_suffix('\r').unwrap_or(yaml))
                .unwrap_or("");
            let body = after_first[offset + line.len()..].trim_start_matches(['\r', '\n']);
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

fn parse_frontmatter(path: &str, yaml: &str) -> Map<String, Value> {
    if yaml.trim().is_empty() {
        return Map::new();
    }
    match serde_yaml::from_str::<Map<String, Value>>(yaml) {
        Ok(map) => map,
        Err(e) => {
            warn!("note '{}': ignoring unparseable frontmatter: {}", path, e);
            Map::new()
        }
    }
}

fn inline_tag_regex() -> &'static Regex {
    static INLINE_TAG: OnceLock<Regex> = OnceLock::new();
    INLINE_TAG.get_or_init(|| {
        Regex::new(r"(?:^|\s)#([\p{L}\p{N}_/-]*[\p{L}_/-][\p{L}\p{N}_/-]*)")
            .expect("inline tag pattern is valid")
    })
}

/// Build the metadata the service reports for a note: frontmatter tags and
/// inline `#tags` from the body, without the leading `#`.
pub fn parse_note(path: &str, content: &str) -> NoteMetadata {
    let (frontmatter, body) = match split_frontmatter(content) {
        Some((yaml, body)) => (parse_frontmatter(path, yaml), body),
        None => (Map::new(), content),
    };

    let mut tags = BTreeSet::new();
    match frontmatter.get("tags") {
        Some(Value::String(s)) => {
            tags.extend(
                s.split([',', ' '])
                    .map(|t| t.trim().trim_start_matches('#'))
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
        Some(Value::Array(items)) => {
            tags.extend(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim_start_matches('#').to_string()),
            );
        }
        _ => {}
    }
    for capture in inline_tag_regex().captures_iter(body) {
        tags.insert(capture[1].to_string());
    }

    NoteMetadata {
        tags,
        frontmatter,
        path: path.to_string(),
        content: content.to_string(),
    }
}
