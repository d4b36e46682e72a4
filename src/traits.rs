//! Collaborator Traits
//!
//! The engine talks to the outside world through three traits and never
//! cares how they are implemented:
//!
//! - `TicketSource`: rate-limited ticketing API (tickets, views, users)
//! - `EnrichmentService`: AI provider producing one analysis per ticket
//! - `ResultSink`: persistence for finished analyses
//!
//! `BatchItem` is the one requirement the batch processor places on its
//! inputs: a stable identifier that appears on the matching result.
//!
//! # Example: Custom Sink
//!
//! ```rust,ignore
//! use ticket_engine::{async_trait, AnalysisResult, ResultSink, Result};
//!
//! struct PostgresSink { /* pool */ }
//!
//! #[async_trait]
//! impl ResultSink for PostgresSink {
//!     async fn save(&self, item_id: &str, result: &AnalysisResult) -> Result<()> {
//!         // INSERT ... ON CONFLICT (ticket_id) DO UPDATE ...
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AnalysisResult, Ticket, TicketFilter, User, View};

/// Upstream ticketing API
///
/// Implementations should map HTTP 429 to
/// [`EngineError::rate_limited`](crate::EngineError::rate_limited) (with the
/// `Retry-After` value when present), and 401/403/404 to the fatal kinds, so
/// retry classification works without knowing the transport.
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Tickets matching `filter`
    async fn fetch_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>>;

    /// All views visible to the integration
    async fn fetch_views(&self) -> Result<Vec<View>>;

    /// Users by id; unknown ids are simply absent from the result
    async fn fetch_users(&self, ids: &[u64]) -> Result<Vec<User>>;

    /// Used for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// AI-backed analysis of a single ticket
///
/// Rate-limit and timeout failures should be reported with the transient
/// kinds; a provider refusing the content is `ContentPolicy` and fatal.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn analyze(&self, ticket_content: &str) -> Result<AnalysisResult>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Persistence for analysis results
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, item_id: &str, result: &AnalysisResult) -> Result<()>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Anything the batch processor can dispatch
pub trait BatchItem: Send + 'static {
    /// Identifier echoed on the item's result
    fn item_id(&self) -> String;
}

impl BatchItem for String {
    fn item_id(&self) -> String {
        self.clone()
    }
}

impl BatchItem for u64 {
    fn item_id(&self) -> String {
        self.to_string()
    }
}

impl BatchItem for Ticket {
    fn item_id(&self) -> String {
        self.id.to_string()
    }
}
