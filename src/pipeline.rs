//! Ticket Pipeline - Collaborators Wired Through Cache, Retry and Batch
//!
//! ```text
//! TicketSource ──(retry)──► CacheManager ──► tickets ──► BatchProcessor
//!                                                         │
//!                            EnrichmentService::analyze ◄─┘ (retry)
//!                            ResultSink::save           ◄── (retry)
//! ```
//!
//! Every upstream read goes through the cache, and every upstream call goes
//! through the retry strategy.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::batch::{BatchOptions, BatchProcessor, BatchReport};
use crate::cache_manager::{CacheManager, StoreKind};
use crate::error::Result;
use crate::models::{AnalysisResult, Ticket, TicketFilter, User, View};
use crate::retry::RetryStrategy;
use crate::traits::{EnrichmentService, ResultSink, TicketSource};

const VIEWS_KEY: &str = "all";

fn user_key(id: u64) -> String {
    format!("user:{id}")
}

pub struct TicketPipeline {
    source: Arc<dyn TicketSource>,
    enricher: Arc<dyn EnrichmentService>,
    sink: Arc<dyn ResultSink>,
    cache: Arc<CacheManager>,
    batch: BatchProcessor,
    retry: RetryStrategy,
}

impl TicketPipeline {
    #[must_use]
    pub fn new(
        source: Arc<dyn TicketSource>,
        enricher: Arc<dyn EnrichmentService>,
        sink: Arc<dyn ResultSink>,
        cache: Arc<CacheManager>,
        batch: BatchProcessor,
        retry: RetryStrategy,
    ) -> Self {
        info!(
            source = source.name(),
            enricher = enricher.name(),
            sink = sink.name(),
            "Ticket pipeline assembled"
        );
        Self {
            source,
            enricher,
            sink,
            cache,
            batch,
            retry,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    async fn fetch_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.retry
            .execute_default(|| self.source.fetch_tickets(filter))
            .await
    }

    /// Tickets matching `filter`, served from the `tickets` store when fresh
    ///
    /// A view served empty from cache is treated as stale: the whole
    /// `tickets` store is refreshed and the view is fetched once more.
    ///
    /// # Errors
    ///
    /// The source's error after retries; nothing is cached on failure.
    pub async fn load_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let key = filter.cache_key();
        let mut fetched = false;

        let tickets: Vec<Ticket> = self
            .cache
            .get_or_populate_typed(StoreKind::Tickets, &key, || {
                fetched = true;
                self.fetch_tickets(filter)
            })
            .await?;

        if tickets.is_empty() && !fetched && filter.view_id.is_some() {
            warn!(key = %key, "Cached view is empty, refreshing tickets store");
            self.cache.force_refresh(StoreKind::Tickets);
            let fresh = self.fetch_tickets(filter).await?;
            self.cache
                .set(StoreKind::Tickets, &key, serde_json::to_value(&fresh)?);
            return Ok(fresh);
        }

        debug!(key = %key, count = tickets.len(), fetched, "Tickets loaded");
        Ok(tickets)
    }

    /// Every view, cached as one entry
    ///
    /// # Errors
    ///
    /// The source's error after retries.
    pub async fn load_views(&self) -> Result<Vec<View>> {
        self.cache
            .get_or_populate_typed(StoreKind::Views, VIEWS_KEY, || {
                self.retry.execute_default(|| self.source.fetch_views())
            })
            .await
    }

    /// Users by id, cached one entry per user
    ///
    /// Only ids without a fresh entry are sent upstream. The result follows
    /// the order of the first occurrence of each id; ids the source does not
    /// know are left out.
    ///
    /// # Errors
    ///
    /// The source's error after retries. Users already cached are not
    /// returned in that case.
    pub async fn load_users(&self, ids: &[u64]) -> Result<Vec<User>> {
        let mut seen = BTreeSet::new();
        let wanted: Vec<u64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let mut found: Vec<(u64, User)> = Vec::with_capacity(wanted.len());
        let mut missing = Vec::new();
        for &id in &wanted {
            let cached = self
                .cache
                .get(StoreKind::Users, &user_key(id))
                .and_then(|value| serde_json::from_value::<User>(value).ok());
            match cached {
                Some(user) => found.push((id, user)),
                None => missing.push(id),
            }
        }

        if !missing.is_empty() {
            debug!(requested = wanted.len(), missing = missing.len(), "Fetching uncached users");
            let fetched = self
                .retry
                .execute_default(|| self.source.fetch_users(&missing))
                .await?;
            for user in fetched {
                self.cache
                    .set(StoreKind::Users, &user_key(user.id), serde_json::to_value(&user)?);
                found.push((user.id, user));
            }
        }

        let mut users = Vec::with_capacity(found.len());
        for id in wanted {
            if let Some(pos) = found.iter().position(|(fid, _)| *fid == id) {
                users.push(found.swap_remove(pos).1);
            }
        }
        Ok(users)
    }

    /// Analyze and persist each ticket in chunks of the configured batch size
    ///
    /// Per ticket: `analyze` with retry, then `save` with retry. Either
    /// failing marks only that ticket as failed.
    pub async fn analyze_tickets(
        &self,
        tickets: Vec<Ticket>,
        options: &BatchOptions,
    ) -> BatchReport<AnalysisResult> {
        let enricher = Arc::clone(&self.enricher);
        let sink = Arc::clone(&self.sink);
        let retry = self.retry;

        self.batch
            .process_in_chunks(
                tickets,
                self.batch.batch_size(),
                move |ticket: Ticket| {
                    let enricher = Arc::clone(&enricher);
                    let sink = Arc::clone(&sink);
                    async move {
                        let content = ticket.content();
                        let analysis = retry
                            .execute_default(|| enricher.analyze(&content))
                            .await?;
                        let item_id = ticket.id.to_string();
                        retry
                            .execute_default(|| sink.save(&item_id, &analysis))
                            .await?;
                        Ok(analysis)
                    }
                },
                options,
            )
            .await
    }

    /// Load a view's tickets and analyze them
    ///
    /// # Errors
    ///
    /// Only loading can fail; per-ticket failures land in the report.
    pub async fn analyze_view(
        &self,
        view_id: u64,
        options: &BatchOptions,
    ) -> Result<BatchReport<AnalysisResult>> {
        let tickets = self.load_tickets(&TicketFilter::view(view_id)).await?;
        info!(view_id, tickets = tickets.len(), "Analyzing view");
        Ok(self.analyze_tickets(tickets, options).await)
    }

    /// Drop every cached ticket list for `view_id`, whatever its filters
    pub fn invalidate_view(&self, view_id: u64) -> usize {
        let prefix = format!("view:{view_id}");
        let scoped = format!("{prefix}:");
        let removed = self.cache.invalidate_pattern(StoreKind::Tickets, |key| {
            key == prefix || key.starts_with(&scoped)
        });
        info!(view_id, removed, "View invalidated");
        removed
    }
}
