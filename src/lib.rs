//! Connects the page in a browser tab to a vault of markdown notes.
//!
//! Templates are rendered in an isolated sandbox reached through a
//! [`channel::RenderChannel`]. Page URLs are looked up in the vault through a
//! [`notes::NoteService`], classified, and shown on a tab's badge.

pub mod channel;
pub mod classify;
pub mod error;
pub mod logging;
pub mod mentions;
pub mod notes;
pub mod page;
pub mod sandbox;
pub mod settings;
pub mod template;

use anyhow::{Context, Result};
use log::debug;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

pub use channel::{ChannelConfig, RenderChannel};
pub use classify::{
    classify, suggest, MatchKind, PresentationState, RenderedNote, Suggestion, TemplateMatcher,
};
pub use error::{ChannelError, QueryError, SuggestionError};
pub use mentions::{MentionAggregator, MentionResult};
pub use notes::{MemoryNoteService, NoteService, RestNoteService};
pub use page::{BadgeSurface, MatchDriver, RefreshOutcome, TabId};
pub use settings::{OutputTemplate, Settings};

/// Everything a host needs: the settings, one render channel, and the badge
/// driver for its note service.
pub struct Bridge<S> {
    settings: RwLock<Settings>,
    settings_path: Option<PathBuf>,
    channel: Arc<RenderChannel>,
    driver: MatchDriver<S>,
}

impl Bridge<RestNoteService> {
    /// Load (and if needed migrate) the settings at `path` and connect to the
    /// note service they name. Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> Result<Self> {
        let settings = settings::load_settings(path)?;
        let service = RestNoteService::from_settings(&settings)
            .with_context(|| format!("connecting to note service at {}", settings.endpoint))?;
        let mut bridge = Self::with_service(settings, service).context("starting template sandbox")?;
        bridge.settings_path = Some(path.to_path_buf());
        Ok(bridge)
    }
}

impl<S: NoteService> Bridge<S> {
    /// Must be called from within a tokio runtime.
    pub fn with_service(settings: Settings, service: S) -> Result<Self, ChannelError> {
        let channel = Arc::new(RenderChannel::spawn(settings.channel_config())?);
        let aggregator = MentionAggregator::new(Arc::new(service), settings.aggregator_config());
        let driver = MatchDriver::new(aggregator, settings.palette.clone());
        Ok(Self {
            settings: RwLock::new(settings),
            settings_path: None,
            channel,
            driver,
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the output templates and persist them when the settings came
    /// from a file. Connection and palette changes apply on the next `open`.
    pub fn set_output_templates(&self, templates: Vec<OutputTemplate>) -> Result<()> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.output_templates = templates;
        if let Some(path) = &self.settings_path {
            settings::save_settings(path, &settings)?;
        }
        Ok(())
    }

    pub fn channel(&self) -> &Arc<RenderChannel> {
        &self.channel
    }

    pub fn driver(&self) -> &MatchDriver<S> {
        &self.driver
    }

    pub async fn render(&self, template: &str, context: Value) -> Result<String, ChannelError> {
        self.channel.send(template, context).await
    }

    /// Render the named output template against a page.
    pub async fn render_output(&self, name: &str, page_context: Value) -> Result<String, SuggestionError> {
        let content = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .template(name)
            .map(|t| t.content_template.clone())
            .ok_or_else(|| SuggestionError::UnknownTemplate(name.to_string()))?;
        Ok(self.channel.send(content, page_context).await?)
    }

    pub async fn on_navigate<B: BadgeSurface>(&self, tab: TabId, url: &str, surface: &B) -> RefreshOutcome {
        self.driver.refresh(tab, url, surface).await
    }

    pub fn on_tab_closed(&self, tab: TabId) {
        self.driver.close_tab(tab);
    }

    /// Render `suggestion` for the page `tab` is showing. Fails with
    /// [`SuggestionError::Stale`] if the tab moved on before the render came
    /// back, so the note is never written with another page's context.
    pub async fn accept_suggestion(
        &self,
        tab: TabId,
        suggestion: &Suggestion,
        page_context: &Value,
    ) -> Result<RenderedNote, SuggestionError> {
        let tracker = self.driver.tracker();
        let generation = tracker.current(tab).ok_or(SuggestionError::Stale)?;
        let templates = self.settings().output_templates;
        let note = suggestion.render(&self.channel, &templates, page_context).await?;
        if !tracker.is_current(tab, generation) {
            debug!("tab {:?}: discarding stale render of {}", tab, suggestion.filename);
            return Err(SuggestionError::Stale);
        }
        Ok(note)
    }

    pub fn shutdown(&self) {
        self.channel.shutdown();
    }
}

/// The render context for a page: `{ page: { url, title, selectedText } }`.
pub fn page_context(url: &str, title: &str, selected_text: Option<&str>) -> Value {
    json!({
        "page": {
            "url": url,
            "title": title,
            "selectedText": selected_text,
        }
    })
}
