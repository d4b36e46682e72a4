//! Ticket Engine Builder
//!
//! Collects configuration and collaborators, validates them, and assembles a
//! [`TicketEngine`].
//!
//! # Example: Cache and Batch Only
//!
//! ```rust,no_run
//! use ticket_engine::TicketEngineBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = TicketEngineBuilder::new().build()?;
//!     assert!(engine.health_check());
//!     Ok(())
//! }
//! ```
//!
//! # Example: Full Pipeline
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ticket_engine::{EngineConfig, TicketEngineBuilder};
//!
//! let engine = TicketEngineBuilder::new()
//!     .with_config(EngineConfig::from_env()?)
//!     .with_source(Arc::new(MyZendeskClient::new()))
//!     .with_enricher(Arc::new(MyModelClient::new()))
//!     .with_sink(Arc::new(MyPostgresSink::new()))
//!     .build()?;
//!
//! let pipeline = engine.pipeline().expect("collaborators configured");
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::batch::BatchProcessor;
use crate::cache_manager::CacheManager;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::TicketPipeline;
use crate::retry::RetryStrategy;
use crate::sweeper::Sweeper;
use crate::traits::{EnrichmentService, ResultSink, TicketSource};
use crate::TicketEngine;

/// Builder for [`TicketEngine`]
///
/// Collaborators are optional as a group: give all three to get a
/// [`TicketPipeline`], or none to use the cache and batch processor alone.
#[derive(Default)]
pub struct TicketEngineBuilder {
    config: EngineConfig,
    source: Option<Arc<dyn TicketSource>>,
    enricher: Option<Arc<dyn EnrichmentService>>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl TicketEngineBuilder {
    /// Builder with default configuration and no collaborators
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn TicketSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn EnrichmentService>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate and assemble the engine
    ///
    /// When `sweep_interval_secs` is set this spawns the sweeper, so it must
    /// be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] for an invalid configuration, a partial set
    /// of collaborators, or a sweep requested outside a runtime.
    pub fn build(self) -> Result<TicketEngine> {
        self.config.validate()?;

        let cache = Arc::new(CacheManager::new(&self.config.cache));
        let batch = BatchProcessor::new(&self.config.batch);
        let retry = RetryStrategy::from_config(&self.config.retry);

        let pipeline = match (self.source, self.enricher, self.sink) {
            (Some(source), Some(enricher), Some(sink)) => Some(TicketPipeline::new(
                source,
                enricher,
                sink,
                Arc::clone(&cache),
                batch.clone(),
                retry,
            )),
            (None, None, None) => None,
            _ => {
                return Err(EngineError::Config(
                    "source, enricher and sink must be configured together".to_string(),
                ));
            }
        };

        let sweeper = match self.config.cache.sweep_interval_secs {
            Some(secs) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(EngineError::Config(
                        "cache sweep requires a tokio runtime".to_string(),
                    ));
                }
                Some(Sweeper::start(Arc::clone(&cache), Duration::from_secs(secs)))
            }
            None => None,
        };

        info!(
            max_workers = self.config.batch.max_workers,
            max_retries = retry.max_retries,
            pipeline = pipeline.is_some(),
            sweeper = sweeper.is_some(),
            "Ticket engine built"
        );

        Ok(TicketEngine {
            config: self.config,
            cache,
            batch,
            retry,
            pipeline,
            sweeper,
        })
    }
}
