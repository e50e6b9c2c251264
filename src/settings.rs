//! Persistent bridge settings.
//!
//! Settings live in one JSON file. Older files are upgraded by a linear
//! chain of migrations, each a pure function from one schema version to the
//! next, and the upgraded file is written back once.

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::classify::BadgePalette;
use crate::mentions::AggregatorConfig;

pub const SETTINGS_VERSION: u64 = 3;

const DEFAULT_ENDPOINT: &str = "https://127.0.0.1:27124/";

/// A user-configured template for content sent to a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputTemplate {
    pub name: String,
    /// Template for the target note path, rendered with the same context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
    pub content_template: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub version: u64,
    pub endpoint: String,
    pub api_key: String,
    pub insecure_tls: bool,
    pub request_timeout_ms: u64,
    pub max_concurrent_fetches: usize,
    pub palette: BadgePalette,
    pub output_templates: Vec<OutputTemplate>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            insecure_tls: true,
            request_timeout_ms: 5_000,
            max_concurrent_fetches: 4,
            palette: BadgePalette::default(),
            output_templates: vec![OutputTemplate {
                name: "Append to daily note".to_string(),
                url_template: Some("Daily/{{date \"%Y-%m-%d\"}}.md".to_string()),
                content_template: "\n## {{page.title}}\n{{page.url}}\n{{#if page.selectedText}}\n{{quote page.selectedText}}\n{{/if}}"
                    .to_string(),
            }],
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            request_timeout: self.request_timeout(),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
        }
    }

    pub fn template(&self, name: &str) -> Option<&OutputTemplate> {
        self.output_templates.iter().find(|t| t.name == name)
    }
}

struct Migration {
    from: u64,
    apply: fn(Map<String, Value>) -> Result<Map<String, Value>>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 1,
        apply: v1_to_v2,
    },
    Migration {
        from: 2,
        apply: v2_to_v3,
    },
];

/// v1 stored the service address in pieces and called templates `templates`.
fn v1_to_v2(mut raw: Map<String, Value>) -> Result<Map<String, Value>> {
    let https = raw.remove("https").and_then(|v| v.as_bool()).unwrap_or(true);
    let host = raw
        .remove("host")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match raw.remove("port") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .unwrap_or(if https { 27124 } else { 27123 });

    let scheme = if https { "https" } else { "http" };
    raw.insert("endpoint".into(), json!(format!("{}://{}:{}/", scheme, host, port)));
    raw.insert("insecureTls".into(), json!(https));
    if let Some(templates) = raw.remove("templates") {
        raw.insert("outputTemplates".into(), templates);
    }
    raw.insert("version".into(), json!(2));
    Ok(raw)
}

/// v3 groups the badge colors into a palette.
fn v2_to_v3(mut raw: Map<String, Value>) -> Result<Map<String, Value>> {
    let mut palette = Map::new();
    for (old, new) in [("directColor", "direct"), ("mentionColor", "mention")] {
        if let Some(color) = raw.remove(old) {
            if !color.is_string() {
                bail!("settings field '{}' must be a string", old);
            }
            palette.insert(new.into(), color);
        }
    }
    if !palette.is_empty() {
        raw.insert("palette".into(), Value::Object(palette));
    }
    raw.insert("version".into(), json!(3));
    Ok(raw)
}

/// Bring a raw settings document up to [`SETTINGS_VERSION`]. Returns the
/// upgraded document and whether any migration ran.
pub fn migrate(raw: Value) -> Result<(Value, bool)> {
    let mut raw = match raw {
        Value::Object(map) => map,
        _ => bail!("settings must be a JSON object"),
    };
    // Files from before versioning carry no version field.
    let mut version = raw.get("version").and_then(Value::as_u64).unwrap_or(1);
    if version > SETTINGS_VERSION {
        bail!(
            "settings version {} is newer than supported version {}",
            version,
            SETTINGS_VERSION
        );
    }

    let mut migrated = false;
    while version < SETTINGS_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|m| m.from == version)
            .with_context(|| format!("no settings migration from version {}", version))?;
        raw = (step.apply)(raw).with_context(|| format!("migrating settings from version {}", version))?;
        version += 1;
        migrated = true;
    }
    Ok((Value::Object(raw), migrated))
}

/// Load settings from `path`, migrating and writing back if needed. A missing
/// file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    let raw: Value = serde_json::from_str(&content)
        .with_context(|| format!("parsing settings in {}", path.display()))?;

    let (raw, migrated) = migrate(raw)?;
    let settings: Settings = serde_json::from_value(raw).context("decoding settings")?;
    if migrated {
        info!(
            "settings: migrated {} to version {}",
            path.display(),
            SETTINGS_VERSION
        );
        save_settings(path, &settings)?;
    }
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)
        .with_context(|| format!("writing settings to {}", path.display()))?;
    Ok(())
}
