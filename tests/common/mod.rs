//! Common utilities for integration tests
//!
//! In-memory collaborators with call counters and scripted failures, plus
//! test data generators. Nothing here touches the network.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use ticket_engine::{
    AnalysisResult, EngineConfig, EngineError, EnrichmentService, Result, ResultSink,
    RetryConfig, Sentiment, Ticket, TicketFilter, TicketSource, Urgency, User, View,
    async_trait,
};

/// Retry settings that keep tests fast
pub fn fast_retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        retry: fast_retry_config(3),
        ..EngineConfig::default()
    }
}

/// Ticket source backed by maps, counting every call
#[derive(Default)]
pub struct FakeTicketSource {
    tickets: Mutex<HashMap<Option<u64>, Vec<Ticket>>>,
    views: Mutex<Vec<View>>,
    users: Mutex<HashMap<u64, User>>,
    failures: Mutex<VecDeque<EngineError>>,
    pub ticket_calls: AtomicU32,
    pub view_calls: AtomicU32,
    pub user_calls: AtomicU32,
    pub user_requests: Mutex<Vec<Vec<u64>>>,
}

impl FakeTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(self, view_id: u64, tickets: Vec<Ticket>) -> Self {
        self.set_view(view_id, tickets);
        self
    }

    pub fn set_view(&self, view_id: u64, tickets: Vec<Ticket>) {
        self.tickets.lock().insert(Some(view_id), tickets);
    }

    pub fn with_views(self, views: Vec<View>) -> Self {
        *self.views.lock() = views;
        self
    }

    pub fn with_users(self, users: Vec<User>) -> Self {
        self.users.lock().extend(users.into_iter().map(|u| (u.id, u)));
        self
    }

    /// The next call (of any kind) fails with `error`
    pub fn fail_next(&self, error: EngineError) {
        self.failures.lock().push_back(error);
    }

    fn take_failure(&self) -> Result<()> {
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn ticket_calls(&self) -> u32 {
        self.ticket_calls.load(Ordering::SeqCst)
    }

    pub fn user_calls(&self) -> u32 {
        self.user_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketSource for FakeTicketSource {
    async fn fetch_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.ticket_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let tickets = self.tickets.lock().get(&filter.view_id).cloned().unwrap_or_default();
        Ok(match filter.limit {
            Some(limit) => tickets.into_iter().take(limit).collect(),
            None => tickets,
        })
    }

    async fn fetch_views(&self) -> Result<Vec<View>> {
        self.view_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        Ok(self.views.lock().clone())
    }

    async fn fetch_users(&self, ids: &[u64]) -> Result<Vec<User>> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        self.user_requests.lock().push(ids.to_vec());
        self.take_failure()?;
        let users = self.users.lock();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    fn name(&self) -> &'static str {
        "fake-source"
    }
}

/// Enrichment service with scripted failures
///
/// - `transient_failures`: the first N calls fail with a rate limit
/// - `rejecting`: content containing any of these words fails with
///   a content-policy error (fatal)
#[derive(Default)]
pub struct ScriptedEnricher {
    pub calls: AtomicU32,
    transient_failures: AtomicU32,
    rejecting: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn rejecting(self, word: &str) -> Self {
        self.rejecting.lock().push(word.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentService for ScriptedEnricher {
    async fn analyze(&self, ticket_content: &str) -> Result<AnalysisResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let throttled = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(EngineError::rate_limited("429 Too Many Requests", None));
        }

        if self.rejecting.lock().iter().any(|w| ticket_content.contains(w.as_str())) {
            return Err(EngineError::content_policy("content rejected by provider"));
        }

        Ok(analysis_for(ticket_content))
    }

    fn name(&self) -> &'static str {
        "scripted-enricher"
    }
}

pub fn analysis_for(content: &str) -> AnalysisResult {
    let urgent = content.to_lowercase().contains("urgent");
    AnalysisResult {
        sentiment: if urgent { Sentiment::Negative } else { Sentiment::Neutral },
        category: "general".to_string(),
        urgency: if urgent { Urgency::High } else { Urgency::Low },
        confidence: 0.9,
        summary: content.lines().next().unwrap_or_default().to_string(),
    }
}

/// Sink keeping everything in memory
#[derive(Default)]
pub struct MemorySink {
    pub saved: Mutex<Vec<(String, AnalysisResult)>>,
    failing_ids: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(self, item_id: &str) -> Self {
        self.failing_ids.lock().insert(item_id.to_string());
        self
    }

    pub fn saved_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.saved.lock().iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn save(&self, item_id: &str, result: &AnalysisResult) -> Result<()> {
        if self.failing_ids.lock().contains(item_id) {
            return Err(EngineError::sink(format!("unique constraint on {item_id}")));
        }
        self.saved.lock().push((item_id.to_string(), result.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory-sink"
    }
}

/// Test data generators
pub mod test_data {
    use ticket_engine::{Ticket, User, View};

    pub fn ticket(id: u64) -> Ticket {
        let mut ticket = Ticket::new(id, format!("Ticket {id}"), format!("Body of ticket {id}"));
        ticket.requester_id = Some(1000 + id);
        ticket
    }

    pub fn tickets(count: u64) -> Vec<Ticket> {
        (1..=count).map(ticket).collect()
    }

    pub fn user(id: u64) -> User {
        User {
            id,
            name: format!("User {id}"),
            email: Some(format!("user{id}@example.com")),
        }
    }

    pub fn view(id: u64) -> View {
        View {
            id,
            title: format!("View {id}"),
            active: true,
        }
    }
}
