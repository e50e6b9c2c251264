//! Handlebars-style templates for note content.
//!
//! Supported: `{{path.to.value}}` interpolation, `{{#if path}}` /
//! `{{#unless path}}` blocks with an optional `{{else}}`, helper calls from
//! the fixed [`Helper`] table, and comments. Output is never escaped: the
//! result is markdown destined for a note, not HTML.
//!
//! A bare `{{name}}` that matches a helper name calls the helper. A context
//! key with the same name is read with `{{this.name}}` or a nested path.

pub mod helpers;
mod parser;

use serde_json::Value;
use std::fmt;

pub use helpers::Helper;

/// A template that failed to compile. `offset` is the byte offset of the
/// offending tag in the source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("template compile error at byte {offset}: {message}")]
pub struct CompileError {
    pub message: String,
    pub offset: usize,
}

impl CompileError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// A helper could not produce output for the values it was given.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("template render error: {message}")]
pub struct RenderError {
    message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// A lookup path into the render context. An empty path is the context itself.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Path(Vec<String>);

impl Path {
    /// Walk the path through objects and arrays.
    fn lookup<'a>(&self, context: &'a Value) -> Option<&'a Value> {
        let mut current = context;
        for segment in &self.0 {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("this")
        } else {
            f.write_str(&self.0.join("."))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Path(Path),
    Literal(Value),
    Undefined,
}

impl Arg {
    fn eval<'a>(&'a self, context: &'a Value) -> Option<&'a Value> {
        match self {
            Arg::Path(path) => path.lookup(context),
            Arg::Literal(value) => Some(value),
            Arg::Undefined => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Path(Path),
    Helper { helper: Helper, args: Vec<Arg> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Expr(Expr),
    Conditional {
        condition: Path,
        negate: bool,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// A compiled template, reusable across contexts.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        Ok(Self {
            nodes: parser::parse(source)?,
        })
    }

    pub fn render(&self, context: &Value) -> Result<String, RenderError> {
        let mut out = String::new();
        render_nodes(&self.nodes, context, &mut out)?;
        Ok(out)
    }
}

/// Compile and render in one step.
pub fn render(source: &str, context: &Value) -> Result<String, TemplateError> {
    Ok(Template::compile(source)?.render(context)?)
}

fn render_nodes(nodes: &[Node], context: &Value, out: &mut String) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Expr(Expr::Path(path)) => {
                if let Some(value) = path.lookup(context) {
                    push_value(out, value);
                }
            }
            Node::Expr(Expr::Helper { helper, args }) => {
                let values: Vec<Option<&Value>> = args.iter().map(|a| a.eval(context)).collect();
                out.push_str(&helper.call(&values)?);
            }
            Node::Conditional {
                condition,
                negate,
                then,
                otherwise,
            } => {
                let truthy = condition.lookup(context).is_some_and(is_truthy);
                let branch = if truthy != *negate { then } else { otherwise };
                render_nodes(branch, context, out)?;
            }
        }
    }
    Ok(())
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}

/// Handlebars truthiness: objects are truthy even when empty, arrays are not.
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
    use serde_json::json;

    #[test]
    fn test_render_nested_paths() {
        let ctx = json!({ "page": { "title": "Bug fix", "tags": ["a", "b"] } });
        let out = render("# {{page.title}} ({{page.tags.1}})", &ctx).unwrap();
        assert_eq!(out, "# Bug fix (b)");
    }

    #[test]
    fn test_render_missing_field_is_empty() {
        let out = render("Title: {{page.missing.deeper}}", &json!({ "page": {} })).unwrap();
        assert_eq!(out, "Title: ");
    }

    #[test]
    fn test_if_block_undefined_and_defined() {
        let template = "{{#if x}}{{x}}{{/if}}";
        assert_eq!(render(template, &json!({})).unwrap(), "");
        assert_eq!(render(template, &json!({ "x": null })).unwrap(), "");
        assert_eq!(render(template, &json!({ "x": "hi" })).unwrap(), "hi");
    }

    #[test]
    fn test_if_else_and_unless() {
        let template = "{{#if done}}yes{{else}}no{{/if}}|{{#unless done}}open{{/unless}}";
        assert_eq!(render(template, &json!({ "done": true })).unwrap(), "yes|");
        assert_eq!(render(template, &json!({ "done": 0 })).unwrap(), "no|open");
    }

    #[test]
    fn test_truthiness_matches_handlebars() {
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!("0")));
    }

    #[test]
    fn test_output_is_not_escaped() {
        let ctx = json!({ "html": "<b>&\"</b>" });
        assert_eq!(render("{{html}} {{{html}}}", &ctx).unwrap(), "<b>&\"</b> <b>&\"</b>");
    }

    #[test]
    fn test_helper_with_path_and_literal_args() {
        let ctx = json!({ "page": { "selection": "one\ntwo", "title": "a:b" } });
        let out = render(
            "{{quote page.selection}}\n{{filename page.title}} {{json \"x\"}}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "> one\n> two\nab \"x\"");
    }

    #[test]
    fn test_helper_runtime_error_surfaces() {
        let err = render("{{quote page.missing}}", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }

    #[test]
    fn test_compiled_template_is_reusable() {
        let template = Template::compile("{{name}}!").unwrap();
        assert_eq!(template.render(&json!({ "name": "a" })).unwrap(), "a!");
        assert_eq!(template.render(&json!({ "name": "b" })).unwrap(), "b!");
    }

    #[test]
    fn test_helper_name_shadows_context_key() {
        let ctx = json!({ "filename": "Clips/a.md", "note": { "filename": "Clips/a.md" } });
        assert_eq!(render("{{filename}}", &ctx).unwrap(), "");
        assert_eq!(render("{{this.filename}}", &ctx).unwrap(), "Clips/a.md");
        assert_eq!(render("{{note.filename}}", &ctx).unwrap(), "Clips/a.md");
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let ctx = json!({ "n": 3, "flag": false, "list": [1, 2] });
        assert_eq!(render("{{n}} {{flag}} {{list}}", &ctx).unwrap(), "3 false [1,2]");
    }
}
