//! Ticket Engine
//!
//! Resilient caching and concurrent batch analysis for support-ticket
//! enrichment:
//! - **TTL Stores**: bounded, thread-safe, lazily expiring, LRU or FIFO eviction
//! - **Cache Manager**: one store per data category with get-or-populate
//! - **Retry Strategy**: exponential backoff with jitter, fatal vs retryable
//! - **Batch Processor**: bounded worker pool with per-item failure isolation
//! - **Pipeline**: ticket source, enrichment service and result sink wired
//!   through all of the above
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ticket_engine::{StoreKind, TicketEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = TicketEngine::builder().build()?;
//!
//!     let tickets = engine
//!         .cache_manager()
//!         .get_or_populate(StoreKind::Tickets, "view:123", || async {
//!             Ok::<_, ticket_engine::EngineError>(serde_json::json!([{"id": 1}]))
//!         })
//!         .await?;
//!
//!     let report = engine
//!         .batch()
//!         .process_batch(vec![1_u64, 2, 3], |id| async move { Ok(id * 2) }, &engine.batch().options())
//!         .await;
//!     tracing::info!(%tickets, summary = %report.summary(), "done");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! TicketSource ─► RetryStrategy ─► CacheManager ─► BatchProcessor ─► EnrichmentService
//!                                   (TtlStore ×3)    (N workers)        └► ResultSink
//! ```

use std::sync::Arc;
use tracing::info;

pub mod batch;
pub mod builder;
pub mod cache_manager;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod sweeper;
pub mod traits;
pub mod ttl_store;

pub use batch::{
    BatchAbort, BatchItemResult, BatchOptions, BatchOutcome, BatchPhase, BatchProcessor,
    BatchReport, BatchSummary, ProgressCallback,
};
pub use builder::TicketEngineBuilder;
pub use cache_manager::{CacheManager, ManagerStats, StoreKind};
pub use config::{BatchConfig, CacheConfig, EngineConfig, EvictionPolicy, RetryConfig, StoreConfig};
pub use error::{EngineError, ErrorKind, Result, Retryability, classify};
pub use models::{AnalysisResult, Sentiment, Ticket, TicketFilter, Urgency, User, View};
pub use pipeline::TicketPipeline;
pub use retry::{RetryAttempt, RetryStrategy};
pub use sweeper::Sweeper;
pub use traits::{BatchItem, EnrichmentService, ResultSink, TicketSource};
pub use ttl_store::{StoreStats, TtlStore};

// Re-export async_trait for collaborator implementations
pub use async_trait::async_trait;

/// Owning context for one engine instance
///
/// Holds the cache manager, batch processor and retry strategy built from
/// one [`EngineConfig`], plus the pipeline when collaborators were given.
/// Independent engines share nothing.
pub struct TicketEngine {
    pub(crate) config: EngineConfig,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) batch: BatchProcessor,
    pub(crate) retry: RetryStrategy,
    pub(crate) pipeline: Option<TicketPipeline>,
    pub(crate) sweeper: Option<Sweeper>,
}

impl TicketEngine {
    #[must_use]
    pub fn builder() -> TicketEngineBuilder {
        TicketEngineBuilder::new()
    }

    /// Engine without collaborators
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] if `config` does not validate.
    pub fn new(config: EngineConfig) -> Result<Self> {
        TicketEngineBuilder::new().with_config(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    #[must_use]
    pub fn batch(&self) -> &BatchProcessor {
        &self.batch
    }

    #[must_use]
    pub fn retry(&self) -> &RetryStrategy {
        &self.retry
    }

    /// Present only when source, enricher and sink were all configured
    #[must_use]
    pub fn pipeline(&self) -> Option<&TicketPipeline> {
        self.pipeline.as_ref()
    }

    #[must_use]
    pub fn health_check(&self) -> bool {
        let healthy = self.cache.health_check();
        if healthy {
            info!("Ticket engine health check passed");
        }
        healthy
    }

    /// Stop background work; cached data is dropped with the engine
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
        info!("Ticket engine shut down");
    }
}

impl std::fmt::Debug for TicketEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketEngine")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline.is_some())
            .field("sweeper", &self.sweeper)
            .finish_non_exhaustive()
    }
}
