//! Keeps each tab's badge in step with the page it is showing.
//!
//! Every refresh of a tab takes a new generation. When an aggregation
//! finishes after the tab has started another refresh, its result belongs to
//! a page the tab no longer shows and is dropped.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::classify::{classify_with, BadgePalette, PresentationState};
use crate::mentions::{MentionAggregator, MentionResult};
use crate::notes::NoteService;

pub const ERROR_BADGE_TEXT: &str = "!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(pub u64);

/// The toolbar badge of the host browser.
pub trait BadgeSurface {
    fn set_color(&self, tab: TabId, color: &str);
    fn set_text(&self, tab: TabId, text: &str);
    fn set_title(&self, tab: TabId, title: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

/// Latest generation per tab. Generations come from one counter shared by
/// all tabs, so a forgotten tab never reuses a number.
#[derive(Debug, Default)]
pub struct PageTracker {
    next: AtomicU64,
    tabs: Mutex<HashMap<TabId, u64>>,
}

impl PageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation for `tab`, superseding any in flight.
    pub fn begin(&self, tab: TabId) -> Generation {
        let generation = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.tabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tab, generation);
        Generation(generation)
    }

    /// The generation `tab` is showing, or `None` for a tab never refreshed
    /// or already closed.
    pub fn current(&self, tab: TabId) -> Option<Generation> {
        let tabs = self.tabs.lock().unwrap_or_else(PoisonError::into_inner);
        tabs.get(&tab).copied().map(Generation)
    }

    pub fn is_current(&self, tab: TabId, generation: Generation) -> bool {
        let tabs = self.tabs.lock().unwrap_or_else(PoisonError::into_inner);
        tabs.get(&tab) == Some(&generation.0)
    }

    /// Drop a closed tab. Refreshes still running for it become stale.
    pub fn forget(&self, tab: TabId) {
        self.tabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tab);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Applied {
        state: PresentationState,
        result: MentionResult,
    },
    /// A search failed; the error badge is showing.
    Failed(String),
    /// The tab moved on before this refresh finished. Nothing was applied.
    Stale,
}

pub struct MatchDriver<S> {
    aggregator: MentionAggregator<S>,
    tracker: PageTracker,
    palette: BadgePalette,
}

impl<S: NoteService> MatchDriver<S> {
    pub fn new(aggregator: MentionAggregator<S>, palette: BadgePalette) -> Self {
        Self {
            aggregator,
            tracker: PageTracker::new(),
            palette,
        }
    }

    pub fn aggregator(&self) -> &MentionAggregator<S> {
        &self.aggregator
    }

    pub fn tracker(&self) -> &PageTracker {
        &self.tracker
    }

    /// Look up `url` and show the result on `tab`'s badge, unless the tab has
    /// been refreshed again in the meantime.
    pub async fn refresh<B: BadgeSurface>(&self, tab: TabId, url: &str, surface: &B) -> RefreshOutcome {
        let generation = self.tracker.begin(tab);
        let aggregated = self.aggregator.aggregate(url).await;
        if !self.tracker.is_current(tab, generation) {
            debug!("tab {:?}: discarding stale result for {}", tab, url);
            return RefreshOutcome::Stale;
        }

        match aggregated {
            Ok(result) => {
                let state = classify_with(&result, &self.palette);
                apply_state(surface, tab, &state);
                RefreshOutcome::Applied { state, result }
            }
            Err(e) => {
                warn!("tab {:?}: lookup for {} failed: {}", tab, url, e);
                let message = e.to_string();
                apply_error(surface, tab, &message, &self.palette);
                RefreshOutcome::Failed(message)
            }
        }
    }

    pub fn close_tab(&self, tab: TabId) {
        self.tracker.forget(tab);
    }
}

pub fn apply_state<B: BadgeSurface>(surface: &B, tab: TabId, state: &PresentationState) {
    if let Some(color) = &state.badge_color {
        surface.set_color(tab, color);
    }
    surface.set_text(tab, &state.badge_text());
    surface.set_title(tab, &state.title());
}

pub fn apply_error<B: BadgeSurface>(surface: &B, tab: TabId, message: &str, palette: &BadgePalette) {
    surface.set_color(tab, &palette.error);
    surface.set_text(tab, ERROR_BADGE_TEXT);
    surface.set_title(tab, message);
}
