//! Reduces a [`MentionResult`] to what the badge shows, and picks a template
//! to offer for a matched note.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::RenderChannel;
use crate::error::SuggestionError;
use crate::mentions::MentionResult;
use crate::notes::{NoteMetadata, SearchHit};
use crate::settings::OutputTemplate;

pub const BADGE_COLOR_FIELD: &str = "web-badge-color";
pub const BADGE_MESSAGE_FIELD: &str = "web-badge-message";
pub const MESSAGE_FIELD: &str = "web-message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    None,
    Mention,
    Direct,
}

/// Badge colors. Any color missing from a settings file keeps its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BadgePalette {
    pub direct: String,
    pub mention: String,
    pub error: String,
}

impl Default for BadgePalette {
    fn default() -> Self {
        Self {
            direct: "#D4AF37".to_string(),
            mention: "#3FA7A3".to_string(),
            error: "#CC3333".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationState {
    pub kind: MatchKind,
    pub badge_count: usize,
    /// `None` leaves the surface color as it is.
    pub badge_color: Option<String>,
    pub badge_message: Option<String>,
    /// Longer line shown alongside the badge, from `web-message`.
    pub message: Option<String>,
    pub degraded: bool,
}

impl PresentationState {
    pub fn empty() -> Self {
        Self {
            kind: MatchKind::None,
            badge_count: 0,
            badge_color: None,
            badge_message: None,
            message: None,
            degraded: false,
        }
    }

    pub fn badge_text(&self) -> String {
        match self.kind {
            MatchKind::None => String::new(),
            _ => self
                .badge_message
                .clone()
                .unwrap_or_else(|| self.badge_count.to_string()),
        }
    }

    pub fn title(&self) -> String {
        let mut title = match self.kind {
            MatchKind::None => return String::new(),
            MatchKind::Direct => match &self.message {
                Some(message) => message.clone(),
                None => format!("{} referencing this page", notes(self.badge_count)),
            },
            MatchKind::Mention => format!("{} mentioning this page", notes(self.badge_count)),
        };
        if self.degraded {
            title.push_str(" (some notes could not be read)");
        }
        title
    }
}

fn notes(count: usize) -> String {
    match count {
        1 => "1 note".to_string(),
        n => format!("{} notes", n),
    }
}

pub fn classify(result: &MentionResult) -> PresentationState {
    classify_with(result, &BadgePalette::default())
}

pub fn classify_with(result: &MentionResult, palette: &BadgePalette) -> PresentationState {
    let degraded = result.is_degraded();
    if !result.direct.is_empty() {
        let metas: Vec<&NoteMetadata> = result.direct.iter().map(|hit| &hit.meta).collect();
        let color = first_override(&metas, BADGE_COLOR_FIELD)
            .map(|c| normalize_color(&c))
            .unwrap_or_else(|| palette.direct.clone());
        return PresentationState {
            kind: MatchKind::Direct,
            badge_count: result.count,
            badge_color: Some(color),
            badge_message: Some(
                first_override(&metas, BADGE_MESSAGE_FIELD)
                    .unwrap_or_else(|| result.count.to_string()),
            ),
            message: first_override(&metas, MESSAGE_FIELD),
            degraded,
        };
    }

    if !result.mentions.is_empty() {
        return PresentationState {
            kind: MatchKind::Mention,
            badge_count: result.count,
            badge_color: Some(palette.mention.clone()),
            badge_message: Some(result.count.to_string()),
            message: None,
            degraded,
        };
    }

    PresentationState {
        degraded,
        ..PresentationState::empty()
    }
}

/// The first note, in hit order, that sets `field` to something displayable.
fn first_override(metas: &[&NoteMetadata], field: &str) -> Option<String> {
    metas.iter().find_map(|meta| match meta.field(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// A bare hex color such as `112233` gets its `#`.
pub fn normalize_color(color: &str) -> String {
    let is_bare_hex =
        matches!(color.len(), 3 | 4 | 6 | 8) && color.chars().all(|c| c.is_ascii_hexdigit());
    if is_bare_hex {
        format!("#{}", color)
    } else {
        color.to_string()
    }
}

/// Maps a matched note to the name of an output template, if any.
pub trait TemplateMatcher {
    fn template_for(&self, hit: &SearchHit, meta: Option<&NoteMetadata>) -> Option<String>;
}

impl<F> TemplateMatcher for F
where
    F: Fn(&SearchHit, Option<&NoteMetadata>) -> Option<String>,
{
    fn template_for(&self, hit: &SearchHit, meta: Option<&NoteMetadata>) -> Option<String> {
        self(hit, meta)
    }
}

/// Offer to apply `template` to the matched note `filename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub filename: String,
    pub template: String,
}

/// Content ready for the outbound write to a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedNote {
    pub filename: String,
    /// Rendered `urlTemplate`, when the template has one.
    pub target: Option<String>,
    pub content: String,
}

/// Direct hits are considered before mentions; the first one the matcher
/// maps to a template wins.
pub fn suggest(result: &MentionResult, matcher: &impl TemplateMatcher) -> Option<Suggestion> {
    let direct = result
        .direct
        .iter()
        .map(|enriched| (&enriched.hit, Some(&enriched.meta)));
    let mentions = result.mentions.iter().map(|hit| (hit, None));
    direct.chain(mentions).find_map(|(hit, meta)| {
        matcher.template_for(hit, meta).map(|template| Suggestion {
            filename: hit.filename.clone(),
            template,
        })
    })
}

impl Suggestion {
    /// Render the suggested template for the matched note. The page context
    /// gains `note.filename` naming the note; a top-level `filename` key would
    /// be shadowed by the `filename` helper.
    pub async fn render(
        &self,
        channel: &RenderChannel,
        templates: &[OutputTemplate],
        page_context: &Value,
    ) -> Result<RenderedNote, SuggestionError> {
        let template = templates
            .iter()
            .find(|t| t.name == self.template)
            .ok_or_else(|| SuggestionError::UnknownTemplate(self.template.clone()))?;

        let mut context = match page_context {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("page".to_string(), other.clone());
                map
            }
        };
        context.insert("note".to_string(), json!({ "filename": self.filename }));
        let context = Value::Object(context);

        let target = async {
            match &template.url_template {
                Some(url_template) => channel
                    .send(url_template.as_str(), context.clone())
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (target, content) = tokio::try_join!(
            target,
            channel.send(template.content_template.as_str(), context.clone()),
        )?;

        Ok(RenderedNote {
            filename: self.filename.clone(),
            target,
            content,
        })
    }
}
