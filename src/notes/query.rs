use regex::Regex;
use serde_json::{json, Value};

use crate::error::QueryError;

/// A structured search expression understood by the note service. It is sent
/// as JsonLogic and can also be evaluated locally against a note document.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// A field reference, dotted. The empty name is the current element.
    Var(String),
    Literal(Value),
    Regexp { pattern: String, field: Box<Query> },
    /// `pattern` is evaluated to a glob, `text` to the string it must match.
    Glob { pattern: Box<Query>, text: Box<Query> },
    Or(Vec<Query>),
    /// True when `predicate` holds for some element of the `list` array.
    Some { list: Box<Query>, predicate: Box<Query> },
}

impl Query {
    pub fn var(name: &str) -> Self {
        Query::Var(name.to_string())
    }

    /// Notes whose content contains `url` followed by whitespace, a closing
    /// parenthesis, or the end of the content.
    pub fn mention(url: &str) -> Self {
        Query::Regexp {
            pattern: mention_pattern(url),
            field: Box::new(Query::var("content")),
        }
    }

    /// Notes whose frontmatter `url`, or any `url-aliases` entry, is a glob
    /// matching `url`.
    pub fn direct(url: &str) -> Self {
        let literal = || Box::new(Query::Literal(Value::String(url.to_string())));
        Query::Or(vec![
            Query::Glob {
                pattern: Box::new(Query::var("frontmatter.url")),
                text: literal(),
            },
            Query::Some {
                list: Box::new(Query::var("frontmatter.url-aliases")),
                predicate: Box::new(Query::Glob {
                    pattern: Box::new(Query::var("")),
                    text: literal(),
                }),
            },
        ])
    }

    pub fn to_json_logic(&self) -> Value {
        match self {
            Query::Var(name) => json!({ "var": name }),
            Query::Literal(value) => value.clone(),
            Query::Regexp { pattern, field } => json!({ "regexp": [pattern, field.to_json_logic()] }),
            Query::Glob { pattern, text } => {
                json!({ "glob": [pattern.to_json_logic(), text.to_json_logic()] })
            }
            Query::Or(items) => {
                json!({ "or": items.iter().map(Query::to_json_logic).collect::<Vec<_>>() })
            }
            Query::Some { list, predicate } => {
                json!({ "some": [list.to_json_logic(), predicate.to_json_logic()] })
            }
        }
    }

    /// Evaluate against `data` with JsonLogic semantics.
    pub fn evaluate(&self, data: &Value) -> Result<Value, QueryError> {
        Ok(match self {
            Query::Var(name) => resolve_var(data, name).cloned().unwrap_or(Value::Null),
            Query::Literal(value) => value.clone(),
            Query::Regexp { pattern, field } => {
                let regex = Regex::new(pattern)
                    .map_err(|e| QueryError::Invalid(format!("bad regexp '{}': {}", pattern, e)))?;
                let matched = match field.evaluate(data)? {
                    Value::String(text) => regex.is_match(&text),
                    _ => false,
                };
                Value::Bool(matched)
            }
            Query::Glob { pattern, text } => {
                let matched = match (pattern.evaluate(data)?, text.evaluate(data)?) {
                    (Value::String(pattern), Value::String(text)) => glob_matches(&pattern, &text)?,
                    _ => false,
                };
                Value::Bool(matched)
            }
            Query::Or(items) => {
                for item in items {
                    if is_truthy(&item.evaluate(data)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Value::Bool(false)
            }
            Query::Some { list, predicate } => {
                let mut matched = false;
                if let Value::Array(elements) = list.evaluate(data)? {
                    for element in &elements {
                        if is_truthy(&predicate.evaluate(element)?) {
                            matched = true;
                            break;
                        }
                    }
                }
                Value::Bool(matched)
            }
        })
    }

    pub fn matches(&self, data: &Value) -> Result<bool, QueryError> {
        Ok(is_truthy(&self.evaluate(data)?))
    }
}

/// `url` escaped for a regular expression, bounded so it does not match a
/// prefix of a longer URL.
pub fn mention_pattern(url: &str) -> String {
    format!(r"{}(?:\s|\)|$)", regex::escape(url))
}

/// `*` matches any run of characters, `?` exactly one; everything else is
/// literal and the whole text must match.
pub fn glob_matches(pattern: &str, text: &str) -> Result<bool, QueryError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    source.push('$');
    let regex = Regex::new(&source)
        .map_err(|e| QueryError::Invalid(format!("bad glob '{}': {}", pattern, e)))?;
    Ok(regex.is_match(text))
}

fn resolve_var<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    if name.is_empty() {
        return Some(data);
    }
    let mut current = data;
    for segment in name.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(content: &str, frontmatter: Value) -> Value {
        json!({ "content": content, "frontmatter": frontmatter })
    }

    #[test]
    fn test_mention_query_json_logic() {
        let query = Query::mention("https://a.example/x?y=1");
        assert_eq!(
            query.to_json_logic(),
            json!({ "regexp": [r"https://a\.example/x\?y=1(?:\s|\)|$)", { "var": "content" }] })
        );
    }

    #[test]
    fn test_direct_query_json_logic() {
        let url = "https://a.example/";
        assert_eq!(
            Query::direct(url).to_json_logic(),
            json!({ "or": [
                { "glob": [{ "var": "frontmatter.url" }, url] },
                { "some": [{ "var": "frontmatter.url-aliases" }, { "glob": [{ "var": "" }, url] }] }
            ] })
        );
    }

    #[test]
    fn test_mention_is_bounded() {
        let query = Query::mention("https://a.example/page");
        assert!(query.matches(&note("see https://a.example/page for more", json!({}))).unwrap());
        assert!(query.matches(&note("[link](https://a.example/page)", json!({}))).unwrap());
        assert!(query.matches(&note("ends with https://a.example/page", json!({}))).unwrap());
        assert!(!query.matches(&note("https://a.example/page2 is different", json!({}))).unwrap());
        assert!(!query.matches(&note("https://a.example/page/sub", json!({}))).unwrap());
    }

    #[test]
    fn test_direct_matches_url_and_aliases() {
        let query = Query::direct("https://a.example/docs/intro");
        let by_glob = note("", json!({ "url": "https://a.example/docs/*" }));
        let by_alias = note("", json!({ "url": "https://other/", "url-aliases": ["nope", "https://a.example/docs/intro"] }));
        let neither = note("", json!({ "url": "https://a.example/blog/*", "url-aliases": "not-a-list" }));

        assert!(query.matches(&by_glob).unwrap());
        assert!(query.matches(&by_alias).unwrap());
        assert!(!query.matches(&neither).unwrap());
        assert!(!query.matches(&note("", json!({}))).unwrap());
    }

    #[test]
    fn test_glob_semantics() {
        assert!(glob_matches("https://x/*", "https://x/a/b").unwrap());
        assert!(glob_matches("a?c", "abc").unwrap());
        assert!(!glob_matches("a?c", "ac").unwrap());
        assert!(!glob_matches("https://x/", "https://x/a").unwrap());
        assert!(glob_matches("a.b(c)", "a.b(c)").unwrap());
        assert!(!glob_matches("a.b", "axb").unwrap());
    }
}
