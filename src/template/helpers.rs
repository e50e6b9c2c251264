use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use serde_json::Value;
use uuid::Uuid;

use super::RenderError;

/// Format used by `{{date}}` when no usable format string is given.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Characters that cannot appear in a vault path segment.
const UNSAFE_FILENAME_CHARS: &[char] = &['/', '\\', '?', '%', '*', ':', '|', '"', '<', '>', '#'];

/// The fixed set of helpers callable from a template.
///
/// Helpers are resolved while compiling, so a template naming anything else
/// never reaches the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    Quote,
    Date,
    Filename,
    Json,
    Uuid,
}

impl Helper {
    pub const ALL: [Helper; 5] = [
        Helper::Quote,
        Helper::Date,
        Helper::Filename,
        Helper::Json,
        Helper::Uuid,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Helper::Quote => "quote",
            Helper::Date => "date",
            Helper::Filename => "filename",
            Helper::Json => "json",
            Helper::Uuid => "uuid",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|helper| helper.name() == name)
    }

    /// Run the helper. Missing arguments arrive as `None`; extra arguments are
    /// ignored, matching how Handlebars passes them.
    pub fn call(&self, args: &[Option<&Value>]) -> Result<String, RenderError> {
        let first = args.first().copied().flatten();
        match self {
            Helper::Quote => match first {
                Some(Value::String(text)) => Ok(quote(text)),
                other => Err(self.type_error("a string", other)),
            },
            Helper::Date => match first {
                Some(Value::String(format)) => format_now(format),
                _ => format_now(DEFAULT_DATE_FORMAT),
            },
            Helper::Filename => match first {
                None | Some(Value::Null) => Ok(String::new()),
                Some(Value::String(name)) => Ok(strip_unsafe_chars(name)),
                other => Err(self.type_error("a string", other)),
            },
            Helper::Json => match first {
                None | Some(Value::Null) => Ok(String::new()),
                Some(value) => serde_json::to_string(value)
                    .map_err(|e| RenderError::new(format!("json: {}", e))),
            },
            Helper::Uuid => Ok(Uuid::new_v4().to_string()),
        }
    }

    fn type_error(&self, expected: &str, got: Option<&Value>) -> RenderError {
        RenderError::new(format!(
            "helper `{}` expects {}, got {}",
            self.name(),
            expected,
            describe(got)
        ))
    }
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string",
        Some(Value::Array(_)) => "an array",
        Some(Value::Object(_)) => "an object",
    }
}

fn quote(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    text.split('\n')
        .map(|line| format!("> {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_unsafe_chars(name: &str) -> String {
    name.chars()
        .filter(|c| !UNSAFE_FILENAME_CHARS.contains(c))
        .collect()
}

fn format_now(format: &str) -> Result<String, RenderError> {
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(RenderError::new(format!(
            "date: invalid format string '{}'",
            format
        )));
    }
    Ok(Local::now().format_with_items(items.iter()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;

    #[test]
    fn test_quote_prefixes_every_line() {
        let text = json!("a\nb");
        assert_eq!(Helper::Quote.call(&[Some(&text)]).unwrap(), "> a\n> b");
    }

    #[test]
    fn test_quote_empty_string() {
        let text = json!("");
        assert_eq!(Helper::Quote.call(&[Some(&text)]).unwrap(), "");
    }

    #[test]
    fn test_quote_rejects_non_string() {
        let err = Helper::Quote.call(&[None]).unwrap_err();
        assert!(err.message().contains("quote"));
        assert!(err.message().contains("undefined"));
    }

    #[test]
    fn test_filename_strips_unsafe_chars() {
        let name = json!("a/b?c*d");
        assert_eq!(Helper::Filename.call(&[Some(&name)]).unwrap(), "abcd");

        let all = json!("x/\\?%*:|\"<>#y");
        assert_eq!(Helper::Filename.call(&[Some(&all)]).unwrap(), "xy");
    }

    #[test]
    fn test_filename_undefined_is_empty() {
        assert_eq!(Helper::Filename.call(&[None]).unwrap(), "");
        assert_eq!(Helper::Filename.call(&[]).unwrap(), "");
    }

    #[test]
    fn test_json_quotes_and_escapes() {
        let text = json!("say \"hi\"\n");
        assert_eq!(
            Helper::Json.call(&[Some(&text)]).unwrap(),
            r#""say \"hi\"\n""#
        );
        assert_eq!(Helper::Json.call(&[None]).unwrap(), "");
    }

    #[test]
    fn test_date_falls_back_for_non_string() {
        let pattern = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").unwrap();
        let options = json!({ "hash": {} });

        let omitted = Helper::Date.call(&[]).unwrap();
        let wrong_type = Helper::Date.call(&[Some(&options)]).unwrap();

        assert!(pattern.is_match(&omitted), "got {}", omitted);
        assert!(pattern.is_match(&wrong_type), "got {}", wrong_type);
    }

    #[test]
    fn test_date_custom_format() {
        let format = json!("%Y");
        let year = Helper::Date.call(&[Some(&format)]).unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_date_invalid_format_is_render_error() {
        let format = json!("%Q%");
        assert!(Helper::Date.call(&[Some(&format)]).is_err());
    }

    #[test]
    fn test_uuid_is_fresh() {
        let a = Helper::Uuid.call(&[]).unwrap();
        let b = Helper::Uuid.call(&[]).unwrap();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_from_name() {
        for helper in Helper::ALL {
            assert_eq!(Helper::from_name(helper.name()), Some(helper));
        }
        assert_eq!(Helper::from_name("upper"), None);
    }
}
