//! Batch Enrichment Demo
//!
//! Runs the full pipeline against in-memory collaborators: a flaky ticket
//! source, an enrichment service that rate-limits and refuses some content,
//! and a sink that prints what it saves.
//!
//! Run with: cargo run --example batch_enrichment
//! More detail: RUST_LOG=ticket_engine=debug cargo run --example batch_enrichment

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use ticket_engine::{
    AnalysisResult, EngineConfig, EngineError, EnrichmentService, Result, ResultSink, Sentiment,
    Ticket, TicketEngine, TicketFilter, TicketSource, Urgency, User, View, async_trait,
};
use tracing_subscriber::EnvFilter;

struct DemoSource {
    calls: AtomicU32,
    views: HashMap<u64, Vec<Ticket>>,
}

impl DemoSource {
    fn new() -> Self {
        let subjects = [
            "Cannot log in after password reset",
            "URGENT: checkout is down for all customers",
            "Feature request: dark mode",
            "Invoice shows the wrong VAT number",
            "Thanks for the quick fix!",
            "App crashes on startup (offensive screenshot attached)",
            "Export to CSV times out",
            "URGENT: data missing from yesterday's report",
        ];
        let tickets = subjects
            .iter()
            .zip(1_u64..)
            .map(|(subject, id)| {
                let mut ticket = Ticket::new(id, *subject, "Reported through the web widget.");
                ticket.requester_id = Some(100 + id % 3);
                ticket
            })
            .collect();
        Self {
            calls: AtomicU32::new(0),
            views: HashMap::from([(360_001, tickets)]),
        }
    }
}

#[async_trait]
impl TicketSource for DemoSource {
    async fn fetch_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        // Every other call is throttled
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(EngineError::rate_limited(
                "429 Too Many Requests",
                Some(Duration::from_millis(200)),
            ));
        }
        let view = filter.view_id.unwrap_or_default();
        Ok(self.views.get(&view).cloned().unwrap_or_default())
    }

    async fn fetch_views(&self) -> Result<Vec<View>> {
        Ok(vec![View {
            id: 360_001,
            title: "Unsolved tickets".into(),
            active: true,
        }])
    }

    async fn fetch_users(&self, ids: &[u64]) -> Result<Vec<User>> {
        Ok(ids
            .iter()
            .map(|&id| User {
                id,
                name: format!("Customer {id}"),
                email: None,
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "demo-helpdesk"
    }
}

struct DemoEnricher {
    calls: AtomicU32,
}

#[async_trait]
impl EnrichmentService for DemoEnricher {
    async fn analyze(&self, ticket_content: &str) -> Result<AnalysisResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        if call % 5 == 4 {
            return Err(EngineError::timeout("model did not answer in time"));
        }
        if ticket_content.contains("offensive") {
            return Err(EngineError::content_policy("provider refused the content"));
        }

        let urgent = ticket_content.contains("URGENT");
        Ok(AnalysisResult {
            sentiment: if ticket_content.contains("Thanks") {
                Sentiment::Positive
            } else if urgent {
                Sentiment::Negative
            } else {
                Sentiment::Neutral
            },
            category: if ticket_content.contains("Invoice") { "billing" } else { "technical" }
                .to_string(),
            urgency: if urgent { Urgency::Critical } else { Urgency::Medium },
            confidence: 0.87,
            summary: ticket_content.lines().next().unwrap_or_default().to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "demo-model"
    }
}

struct PrintingSink;

#[async_trait]
impl ResultSink for PrintingSink {
    async fn save(&self, item_id: &str, result: &AnalysisResult) -> Result<()> {
        println!(
            "  saved #{item_id:<3} {:?}/{:?} [{}] {}",
            result.sentiment, result.urgency, result.category, result.summary
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut config = EngineConfig::from_env()?;
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 1_000;
    config.batch.max_workers = 4;
    config.cache.sweep_interval_secs = Some(30);

    let engine = TicketEngine::builder()
        .with_config(config)
        .with_source(Arc::new(DemoSource::new()))
        .with_enricher(Arc::new(DemoEnricher {
            calls: AtomicU32::new(0),
        }))
        .with_sink(Arc::new(PrintingSink))
        .build()?;

    if engine.health_check() {
        println!("=== Engine healthy ===\n");
    }

    let pipeline = engine
        .pipeline()
        .ok_or_else(|| anyhow::anyhow!("pipeline not configured"))?;

    let views = pipeline.load_views().await?;
    println!("Views: {}", views.iter().map(|v| v.title.as_str()).collect::<Vec<_>>().join(", "));

    let tickets = pipeline.load_tickets(&TicketFilter::view(360_001)).await?;
    let requester_ids: Vec<u64> = tickets.iter().flat_map(Ticket::user_ids).collect();
    let users = pipeline.load_users(&requester_ids).await?;
    println!("Loaded {} tickets from {} customers\n", tickets.len(), users.len());

    let options = engine
        .batch()
        .options()
        .with_progress(|done, total| tracing::debug!(done, total, "progress"));
    let report = pipeline.analyze_tickets(tickets, &options).await;

    println!("\n=== {} in {:?} ===", report.summary(), report.elapsed);
    for (id, error) in report.failures() {
        println!("  failed #{id}: {error}");
    }

    // Served from cache this time
    let again = pipeline.load_tickets(&TicketFilter::view(360_001)).await?;
    let stats = engine.cache_manager().stats_snapshot();
    println!(
        "\nReloaded {} tickets; cache hits {} misses {}",
        again.len(),
        stats.total_hits(),
        stats.total_misses()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    engine.shutdown().await;
    Ok(())
}
