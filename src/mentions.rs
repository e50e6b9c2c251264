//! Finds the notes that reference a page.
//!
//! Two searches run against the note service: a "mention" search for the
//! literal URL in note content, and a "direct" search for notes whose
//! frontmatter names the URL. Direct hits are then enriched with their
//! metadata, a bounded number of fetches at a time.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::QueryError;
use crate::notes::{NoteMetadata, NoteService, Query, SearchHit};

pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub max_concurrent_fetches: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }
}

/// A direct hit paired with the note's metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedHit {
    pub hit: SearchHit,
    pub meta: NoteMetadata,
}

impl EnrichedHit {
    pub fn filename(&self) -> &str {
        &self.hit.filename
    }
}

/// A direct hit whose metadata could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MentionResult {
    pub mentions: Vec<SearchHit>,
    pub direct: Vec<EnrichedHit>,
    /// Distinct filenames across `mentions` and `direct`.
    pub count: usize,
    pub failures: Vec<FetchFailure>,
}

impl MentionResult {
    pub fn new(mentions: Vec<SearchHit>, direct: Vec<EnrichedHit>, failures: Vec<FetchFailure>) -> Self {
        let count = mentions
            .iter()
            .map(|hit| hit.filename.as_str())
            .chain(direct.iter().map(EnrichedHit::filename))
            .collect::<HashSet<_>>()
            .len();
        Self {
            mentions,
            direct,
            count,
            failures,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mentions.is_empty() && self.direct.is_empty()
    }

    /// Some direct hits are missing because their metadata fetch failed.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct MentionAggregator<S> {
    service: Arc<S>,
    config: AggregatorConfig,
}

impl<S: NoteService> MentionAggregator<S> {
    pub fn new(service: Arc<S>, config: AggregatorConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Collect every note that mentions or directly references `url`.
    ///
    /// A failed search is an error, never an empty result. A failed metadata
    /// fetch only drops that one hit and is reported in `failures`.
    pub async fn aggregate(&self, url: &str) -> Result<MentionResult, QueryError> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(MentionResult::default());
        }

        let mention_query = Query::mention(url);
        let direct_query = Query::direct(url);
        let (mentions, direct_hits) = tokio::try_join!(
            self.service.search(&mention_query),
            self.service.search(&direct_query),
        )?;
        debug!(
            "aggregate {}: {} mentions, {} direct",
            url,
            mentions.len(),
            direct_hits.len()
        );

        let (direct, failures) = self.enrich(direct_hits).await;
        Ok(MentionResult::new(mentions, direct, failures))
    }

    async fn enrich(&self, hits: Vec<SearchHit>) -> (Vec<EnrichedHit>, Vec<FetchFailure>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_fetches.max(1)));
        let mut fetches = JoinSet::new();
        for (index, hit) in hits.iter().enumerate() {
            let service = Arc::clone(&self.service);
            let permits = Arc::clone(&permits);
            let path = hit.filename.clone();
            fetches.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, service.fetch_note(&path).await)
            });
        }

        let mut slots: Vec<Option<Result<NoteMetadata, String>>> = vec![None; hits.len()];
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result.map_err(|e| e.to_string())),
                Err(e) => warn!("metadata fetch task failed: {}", e),
            }
        }

        let mut direct = Vec::with_capacity(hits.len());
        let mut failures = Vec::new();
        for (hit, slot) in hits.into_iter().zip(slots) {
            match slot {
                Some(Ok(meta)) => direct.push(EnrichedHit { hit, meta }),
                Some(Err(error)) => {
                    warn!("metadata fetch for '{}' failed: {}", hit.filename, error);
                    failures.push(FetchFailure {
                        filename: hit.filename,
                        error,
                    });
                }
                None => failures.push(FetchFailure {
                    filename: hit.filename,
                    error: "metadata fetch aborted".to_string(),
                }),
            }
        }
        (direct, failures)
    }
}
